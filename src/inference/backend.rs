// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 模型执行后端接口
//!
//! 执行器只依赖这里的同步原语: 填充输入、提交批次、轮询完成、读取输出张量。
//! 具体的推理运行时实现该 trait 接入流水线。

use std::time::Duration;

use ndarray::ArrayD;

use crate::buffer::{Buffer, PixelFormat};
use crate::error::Result;

/// 输入要求 (上游生产者据此决定输出几何与格式)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRequirements {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl InputRequirements {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// 完全匹配, 或宽高按 16 对齐后匹配
    pub fn accepts(&self, width: u32, height: u32, pitch: u32, format: PixelFormat) -> bool {
        if format != self.format {
            return false;
        }
        if width == self.width && height == self.height && pitch == self.width {
            return true;
        }
        width == align16(self.width) && height == align16(self.height)
    }
}

fn align16(v: u32) -> u32 {
    v.div_ceil(16) * 16
}

/// 输出张量描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub name: String,
    pub shape: Vec<usize>,
}

/// 模型加载后的描述信息
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub batch_size: usize,
    pub input: InputRequirements,
    pub outputs: Vec<OutputInfo>,
}

/// 一个输出张量
#[derive(Debug, Clone)]
pub struct OutputTensor {
    pub name: String,
    pub data: ArrayD<f32>,
}

impl OutputTensor {
    pub fn new(name: &str, data: ArrayD<f32>) -> Self {
        Self {
            name: name.to_string(),
            data,
        }
    }
}

/// 执行槽位状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    Pending,
    Ready,
    Failed(String),
}

/// 模型执行后端
pub trait ModelBackend: Send {
    /// 加载模型并分配 `depth` 个执行槽位
    fn load(&mut self, batch_size: usize, depth: usize) -> Result<ModelInfo>;

    /// 输入要求, `load` 之后有效
    fn requirements(&self) -> InputRequirements;

    /// 把图像拷贝到槽位输入区的 `index` 位置
    fn fill_input(&mut self, slot: usize, index: usize, image: &Buffer) -> Result<()>;

    /// 异步提交 `count` 张图像
    fn submit(&mut self, slot: usize, count: usize) -> Result<()>;

    /// 非阻塞完成检查
    fn poll(&mut self, slot: usize) -> SlotStatus;

    /// 阻塞等待完成, 超时返回 `Pending`
    fn wait(&mut self, slot: usize, timeout: Duration) -> SlotStatus;

    /// 读取已完成槽位的输出张量
    fn outputs(&mut self, slot: usize) -> Result<Vec<OutputTensor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirements_exact() {
        let req = InputRequirements::new(300, 300, PixelFormat::Rgbp);
        assert!(req.accepts(300, 300, 300, PixelFormat::Rgbp));
        assert!(!req.accepts(300, 300, 300, PixelFormat::Nv12));
        assert!(!req.accepts(416, 416, 416, PixelFormat::Rgbp));
    }

    #[test]
    fn test_requirements_aligned() {
        let req = InputRequirements::new(300, 300, PixelFormat::Rgbp);
        assert!(req.accepts(304, 304, 304, PixelFormat::Rgbp));
        // pitch 不等于宽度时只接受对齐尺寸
        assert!(!req.accepts(300, 300, 320, PixelFormat::Rgbp));
    }
}
