// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv4 后处理模块
// 多尺度 Region 输出 [B, num*(coords+1+classes), H, W], 输出按网格高度降序排列,
// 第 k 个输出使用 masks[k*num..(k+1)*num] 选出的 anchor。

use ndarray::Axis;

use super::Postprocessor;
use crate::buffer::{Buffer, Tag};
use crate::detection::{suppress, BBox, Detection, SuppressionPolicy};
use crate::error::{PipelineError, Result};
use crate::inference::backend::{ModelInfo, OutputTensor};

/// YOLO 配置
#[derive(Debug, Clone)]
pub struct YoloConfig {
    /// anchor (w, h) 对, 单位为输入像素
    pub anchors: Vec<f32>,
    pub masks: Vec<usize>,
    /// 每个尺度的 anchor 数
    pub num: usize,
    pub coords: usize,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub policy: SuppressionPolicy,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            // YOLOv4 anchors
            anchors: vec![
                12.0, 16.0, 19.0, 36.0, 40.0, 28.0, // 大尺度网格
                36.0, 75.0, 76.0, 55.0, 72.0, 146.0, // 中尺度
                142.0, 110.0, 192.0, 243.0, 459.0, 401.0, // 小尺度
            ],
            masks: (0..9).collect(),
            num: 3,
            coords: 4,
            conf_threshold: 0.8,
            iou_threshold: 0.5,
            policy: SuppressionPolicy::Exclusion,
        }
    }
}

/// 单个尺度的解码参数
#[derive(Debug, Clone)]
struct Region {
    name: String,
    classes: usize,
    anchors: Vec<f32>,
    side_w: usize,
    side_h: usize,
}

/// YOLO 后处理器
pub struct YoloPostprocessor {
    config: YoloConfig,
    input_width: f32,
    input_height: f32,
    regions: Vec<Region>,
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl YoloPostprocessor {
    pub fn new(config: YoloConfig) -> Self {
        Self {
            config,
            input_width: 416.0,
            input_height: 416.0,
            regions: Vec::new(),
        }
    }

    /// 通道布局 `(n*(coords+classes+1) + entry) * cells + loc`
    #[inline]
    fn entry_index(&self, region: &Region, n: usize, entry: usize, loc: usize) -> usize {
        let cells = region.side_w * region.side_h;
        (n * (self.config.coords + region.classes + 1) + entry) * cells + loc
    }

    /// 解码单个尺度中一张图像的输出
    fn decode_region(&self, data: &[f32], region: &Region, out: &mut Vec<Detection>) {
        let cells = region.side_w * region.side_h;
        let thr = self.config.conf_threshold;
        let num = region.anchors.len() / 2;
        for i in 0..cells {
            let row = i / region.side_w;
            let col = i % region.side_w;
            for n in 0..num {
                let obj_index = self.entry_index(region, n, self.config.coords, i);
                let box_index = self.entry_index(region, n, 0, i);
                let objectness = sigmoid(data[obj_index]);
                if objectness < thr {
                    continue;
                }
                let x = (col as f32 + sigmoid(data[box_index])) / region.side_w as f32;
                let y = (row as f32 + sigmoid(data[box_index + cells])) / region.side_h as f32;
                let w = data[box_index + 2 * cells].exp() * region.anchors[2 * n] / self.input_width;
                let h = data[box_index + 3 * cells].exp() * region.anchors[2 * n + 1]
                    / self.input_height;
                let bbox = BBox::from_center(x, y, w, h).clamped();

                for j in 0..region.classes {
                    let class_index = self.entry_index(region, n, self.config.coords + 1 + j, i);
                    let prob = objectness * sigmoid(data[class_index]);
                    if prob >= thr {
                        // 类别从 1 开始编号
                        out.push(Detection::new(bbox, j as i32 + 1, prob));
                    }
                }
            }
        }
    }
}

impl Postprocessor for YoloPostprocessor {
    fn configure(&mut self, info: &ModelInfo) -> Result<()> {
        self.input_width = info.input.width as f32;
        self.input_height = info.input.height as f32;

        let num = self.config.num;
        if self.config.masks.len() != num * info.outputs.len() {
            return Err(PipelineError::ModelLoad(format!(
                "mask 数量 {} 与输出数量 {} 不匹配",
                self.config.masks.len(),
                info.outputs.len()
            )));
        }

        // 按网格高度降序
        let mut outputs = info.outputs.clone();
        outputs.sort_by(|a, b| b.shape.get(2).cmp(&a.shape.get(2)));

        self.regions.clear();
        for (k, output) in outputs.iter().enumerate() {
            let [_, channels, side_h, side_w] = output.shape[..] else {
                return Err(PipelineError::ModelLoad(format!(
                    "输出 {} 形状 {:?} 不是 NCHW",
                    output.name, output.shape
                )));
            };
            if channels % num != 0 || channels / num < self.config.coords + 1 {
                return Err(PipelineError::ModelLoad(format!(
                    "输出 {} 通道数 {} 不合法",
                    output.name, channels
                )));
            }
            let mut anchors = Vec::with_capacity(num * 2);
            for &m in &self.config.masks[k * num..(k + 1) * num] {
                let (Some(&w), Some(&h)) =
                    (self.config.anchors.get(m * 2), self.config.anchors.get(m * 2 + 1))
                else {
                    return Err(PipelineError::ModelLoad(format!("mask {} 超出 anchor 范围", m)));
                };
                anchors.push(w);
                anchors.push(h);
            }
            self.regions.push(Region {
                name: output.name.clone(),
                classes: channels / num - self.config.coords - 1,
                anchors,
                side_w,
                side_h,
            });
        }
        tracing::debug!(regions = self.regions.len(), "yolo regions configured");
        Ok(())
    }

    fn translate(&self, outputs: &[OutputTensor], tags: &[Tag]) -> Result<Vec<Buffer>> {
        let mut results = Vec::new();
        for (b, tag) in tags.iter().enumerate() {
            let mut candidates = Vec::new();
            for region in &self.regions {
                let Some(tensor) = outputs.iter().find(|t| t.name == region.name) else {
                    tracing::warn!(output = %region.name, "⚠️ 缺少 YOLO 输出");
                    continue;
                };
                if b >= tensor.data.shape().first().copied().unwrap_or(0) {
                    tracing::warn!(output = %region.name, batch = b, "⚠️ 批次下标越界");
                    continue;
                }
                let data: Vec<f32> = tensor.data.index_axis(Axis(0), b).iter().copied().collect();
                let expected = (region.anchors.len() / 2)
                    * (self.config.coords + region.classes + 1)
                    * region.side_w
                    * region.side_h;
                if data.len() != expected {
                    tracing::warn!(output = %region.name, len = data.len(), expected, "⚠️ YOLO 输出长度不符");
                    continue;
                }
                self.decode_region(&data, region, &mut candidates);
            }

            let kept = suppress(candidates, self.config.policy, self.config.iou_threshold);
            for (roi, det) in kept.into_iter().enumerate() {
                results.push(Buffer::roi(
                    det.bbox,
                    det.class_id,
                    det.confidence,
                    Tag::new(tag.channel, tag.frame, roi as u32),
                ));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferKind, PixelFormat};
    use crate::inference::backend::{InputRequirements, OutputInfo};
    use ndarray::{ArrayD, IxDyn};

    const CLASSES: usize = 2;
    const CH: usize = 3 * (4 + 1 + CLASSES);

    fn info(shapes: &[(usize, usize)]) -> ModelInfo {
        ModelInfo {
            batch_size: 1,
            input: InputRequirements::new(416, 416, PixelFormat::Rgbp),
            outputs: shapes
                .iter()
                .enumerate()
                .map(|(i, &(h, w))| OutputInfo {
                    name: format!("out{}", i),
                    shape: vec![1, CH, h, w],
                })
                .collect(),
        }
    }

    /// 所有 logit 取很小的值, 只点亮指定的格子
    fn quiet(name: &str, side: usize) -> OutputTensor {
        OutputTensor::new(name, ArrayD::from_elem(IxDyn(&[1, CH, side, side]), -20.0))
    }

    fn light(t: &mut OutputTensor, side: usize, n: usize, loc: usize, class: usize) {
        let cells = side * side;
        let base = n * (4 + 1 + CLASSES);
        let flat = t.data.as_slice_mut().unwrap();
        flat[(base) * cells + loc] = 0.0; // x -> 0.5
        flat[(base + 1) * cells + loc] = 0.0; // y -> 0.5
        flat[(base + 2) * cells + loc] = 0.0; // w -> anchor
        flat[(base + 3) * cells + loc] = 0.0; // h -> anchor
        flat[(base + 4) * cells + loc] = 10.0; // obj
        flat[(base + 5 + class) * cells + loc] = 10.0;
    }

    #[test]
    fn test_config_default() {
        let cfg = YoloConfig::default();
        assert_eq!(cfg.anchors.len(), 18);
        assert_eq!(cfg.masks.len(), 9);
        assert_eq!(cfg.iou_threshold, 0.5);
    }

    #[test]
    fn test_configure_sorts_by_grid_height() {
        let mut post = YoloPostprocessor::new(YoloConfig::default());
        post.configure(&info(&[(13, 13), (52, 52), (26, 26)])).unwrap();
        let sides: Vec<usize> = post.regions.iter().map(|r| r.side_h).collect();
        assert_eq!(sides, vec![52, 26, 13]);
        // 最大网格使用最小的 anchor
        assert_eq!(&post.regions[0].anchors[..2], &[12.0, 16.0]);
        assert_eq!(post.regions[0].classes, CLASSES);
    }

    #[test]
    fn test_configure_rejects_mask_mismatch() {
        let mut post = YoloPostprocessor::new(YoloConfig::default());
        assert!(post.configure(&info(&[(13, 13)])).is_err());
    }

    #[test]
    fn test_decode_single_cell() {
        let mut post = YoloPostprocessor::new(YoloConfig::default());
        post.configure(&info(&[(4, 4), (2, 2), (1, 1)])).unwrap();
        let mut big = quiet("out0", 4);
        // 第 (row 1, col 2) 格, anchor 0, 类别 1
        light(&mut big, 4, 0, 4 + 2, 1);
        let outputs = vec![big, quiet("out1", 2), quiet("out2", 1)];

        let results = post.translate(&outputs, &[Tag::new(3, 8, 0)]).unwrap();
        assert_eq!(results.len(), 1);
        let BufferKind::DetectionBox(det) = results[0].kind() else {
            panic!("expected detection");
        };
        assert_eq!(det.class_id, 2);
        assert!(det.confidence > 0.99);
        let cx = (det.bbox.x1 + det.bbox.x2) / 2.0;
        let cy = (det.bbox.y1 + det.bbox.y2) / 2.0;
        assert!((cx - 2.5 / 4.0).abs() < 1e-4);
        assert!((cy - 1.5 / 4.0).abs() < 1e-4);
        assert!((det.bbox.width() - 12.0 / 416.0).abs() < 1e-4);
        assert_eq!(results[0].tag(), Tag::new(3, 8, 0));
    }

    #[test]
    fn test_overlapping_boxes_suppressed() {
        let mk = |policy, iou_threshold| {
            let mut post = YoloPostprocessor::new(YoloConfig {
                policy,
                iou_threshold,
                ..YoloConfig::default()
            });
            post.configure(&info(&[(4, 4), (2, 2), (1, 1)])).unwrap();
            post
        };
        let mut big = quiet("out0", 4);
        // 同一格子两个 anchor: 12x16 与 19x36, IoU ≈ 0.28
        light(&mut big, 4, 0, 5, 0);
        light(&mut big, 4, 1, 5, 1);
        let outputs = vec![big, quiet("out1", 2), quiet("out2", 1)];
        let tags = [Tag::new(0, 0, 0)];

        let loose = mk(SuppressionPolicy::Greedy, 0.5).translate(&outputs, &tags).unwrap();
        assert_eq!(loose.len(), 2);
        let rois: Vec<u32> = loose.iter().map(|b| b.roi_index()).collect();
        assert_eq!(rois, vec![0, 1]);

        // 贪心策略不区分类别
        let greedy = mk(SuppressionPolicy::Greedy, 0.25).translate(&outputs, &tags).unwrap();
        assert_eq!(greedy.len(), 1);

        // 排除策略只比较同类
        let exclusion = mk(SuppressionPolicy::Exclusion, 0.25).translate(&outputs, &tags).unwrap();
        assert_eq!(exclusion.len(), 2);
    }
}
