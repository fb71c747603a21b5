// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测结果数据结构
/// Normalized detection boxes shared by the post-processors and buffers

// ========== 数据结构 ==========

/// 归一化检测框, 坐标范围 [0, 1]
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct BBox {
    pub x1: f32, // left
    pub y1: f32, // top
    pub x2: f32, // right
    pub y2: f32, // bottom
}

/// 带类别与置信度的检测框
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: i32,
    pub confidence: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 由中心点与宽高构造
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// 裁剪到 [0, 1]
    pub fn clamped(&self) -> Self {
        Self {
            x1: self.x1.clamp(0.0, 1.0),
            y1: self.y1.clamp(0.0, 1.0),
            x2: self.x2.clamp(0.0, 1.0),
            y2: self.y2.clamp(0.0, 1.0),
        }
    }

    /// 交并比
    ///
    /// 任一轴重叠为负时交集为 0; 并集由容斥计算, 并集 <= 0 时返回 0
    pub fn iou(&self, other: &BBox) -> f32 {
        let overlap_w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let overlap_h = self.y2.min(other.y2) - self.y1.max(other.y1);
        let intersection = if overlap_w < 0.0 || overlap_h < 0.0 {
            0.0
        } else {
            overlap_w * overlap_h
        };
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

impl Detection {
    pub fn new(bbox: BBox, class_id: i32, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
        }
    }
}
