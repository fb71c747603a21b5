// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 分类后处理: 输出 [B, classes] (或 [B, classes, 1, 1]), 每张图像取最大分数

use ndarray::Axis;

use super::Postprocessor;
use crate::buffer::{Buffer, Tag};
use crate::error::{PipelineError, Result};
use crate::inference::backend::OutputTensor;

#[derive(Debug, Default)]
pub struct ClassifyPostprocessor;

impl ClassifyPostprocessor {
    pub fn new() -> Self {
        Self
    }
}

impl Postprocessor for ClassifyPostprocessor {
    fn translate(&self, outputs: &[OutputTensor], tags: &[Tag]) -> Result<Vec<Buffer>> {
        let output = outputs
            .first()
            .ok_or_else(|| PipelineError::MalformedOutput("分类输出为空".into()))?;
        let batch = output.data.shape().first().copied().unwrap_or(0);
        let mut results = Vec::with_capacity(tags.len());
        for (b, tag) in tags.iter().enumerate() {
            if b >= batch {
                tracing::warn!(batch = b, "⚠️ 分类输出批次不足, 跳过");
                continue;
            }
            let scores = output.data.index_axis(Axis(0), b);
            let best = scores
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b));
            if let Some((class_id, &confidence)) = best {
                results.push(Buffer::classification(class_id as i32, confidence, *tag));
            }
        }
        Ok(results)
    }
}
