// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 模型后处理器
///
/// # 架构说明
///
/// 执行器在批次完成后把原始输出张量交给后处理器, 后处理器按插入时记录的
/// (channel, frame, roi) 标签生成带类型的结果 Buffer。
///
/// ## 后处理器 (Postprocessor Pattern)
/// - **SSD**: 单阶段检测头, 每行 `[imgid, label, conf, l, t, r, b]`
///   - 文件: `ssd.rs`
/// - **YOLO**: 多尺度网格 + anchor 解码, 两种抑制策略
///   - 文件: `yolo.rs`
/// - **Classify**: 每张图像取 argmax
///   - 文件: `classify.rs`
///
/// ## 使用示例
/// ```rust,ignore
/// use vapipe_rs::models::{ModelKind, create_postprocessor};
///
/// let mut post = create_postprocessor(ModelKind::Yolo, &config);
/// post.configure(&model_info)?;
/// let results = post.translate(&outputs, &tags)?;
/// ```
use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, Tag};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::inference::backend::{ModelInfo, OutputTensor};

pub mod classify;
pub mod ssd;
pub mod yolo;

pub use classify::ClassifyPostprocessor;
pub use ssd::{SsdConfig, SsdPostprocessor};
pub use yolo::{YoloConfig, YoloPostprocessor};

/// 模型类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// MobileNet-SSD 单阶段检测
    Ssd,
    /// YOLOv4 多尺度网格检测
    Yolo,
    /// ResNet 图像分类
    Resnet,
}

impl ModelKind {
    /// 默认输入尺寸
    pub fn default_input_size(&self) -> (u32, u32) {
        match self {
            ModelKind::Ssd => (300, 300),
            ModelKind::Yolo => (416, 416),
            ModelKind::Resnet => (224, 224),
        }
    }

    /// 输出检测框 (否则输出分类结果)
    pub fn is_detector(&self) -> bool {
        !matches!(self, ModelKind::Resnet)
    }
}

/// 原始输出 → 结果 Buffer
pub trait Postprocessor: Send {
    /// 根据模型描述初始化 (输出名称、形状)
    fn configure(&mut self, _info: &ModelInfo) -> Result<()> {
        Ok(())
    }

    /// 翻译一个已完成批次; `tags[i]` 为批次中第 i 张图像的标签
    fn translate(&self, outputs: &[OutputTensor], tags: &[Tag]) -> Result<Vec<Buffer>>;
}

/// 按模型类型创建后处理器
pub fn create_postprocessor(kind: ModelKind, config: &PipelineConfig) -> Box<dyn Postprocessor> {
    match kind {
        ModelKind::Ssd => Box::new(SsdPostprocessor::new(SsdConfig {
            conf_threshold: config.conf_threshold,
        })),
        ModelKind::Yolo => Box::new(YoloPostprocessor::new(YoloConfig {
            conf_threshold: config.conf_threshold,
            iou_threshold: config.iou_threshold,
            policy: config.suppression,
            ..YoloConfig::default()
        })),
        ModelKind::Resnet => Box::new(ClassifyPostprocessor::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sizes() {
        assert_eq!(ModelKind::Ssd.default_input_size(), (300, 300));
        assert_eq!(ModelKind::Yolo.default_input_size(), (416, 416));
        assert_eq!(ModelKind::Resnet.default_input_size(), (224, 224));
        assert!(!ModelKind::Resnet.is_detector());
    }
}
