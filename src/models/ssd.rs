// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// MobileNet-SSD 后处理模块
// DetectionOutput 层输出 [1, 1, N, 7], 每行 [imgid, label, conf, l, t, r, b]

use ndarray::Axis;

use super::Postprocessor;
use crate::buffer::{Buffer, Tag};
use crate::detection::BBox;
use crate::error::{PipelineError, Result};
use crate::inference::backend::OutputTensor;

const ROW_SIZE: usize = 7;

/// SSD 配置
#[derive(Debug, Clone)]
pub struct SsdConfig {
    pub conf_threshold: f32,
}

impl Default for SsdConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.8,
        }
    }
}

/// SSD 后处理器
pub struct SsdPostprocessor {
    config: SsdConfig,
}

impl SsdPostprocessor {
    pub fn new(config: SsdConfig) -> Self {
        Self { config }
    }
}

impl Postprocessor for SsdPostprocessor {
    fn translate(&self, outputs: &[OutputTensor], tags: &[Tag]) -> Result<Vec<Buffer>> {
        let output = outputs
            .first()
            .ok_or_else(|| PipelineError::MalformedOutput("SSD 输出为空".into()))?;
        let shape = output.data.shape();
        if shape.last() != Some(&ROW_SIZE) {
            return Err(PipelineError::MalformedOutput(format!(
                "SSD 输出形状 {:?}, 最后一维应为 {}",
                shape, ROW_SIZE
            )));
        }

        // 按图像分组, 每张图像内重新编号 roi
        let mut per_image: Vec<Vec<Buffer>> = vec![Vec::new(); tags.len()];
        let rows = output
            .data
            .view()
            .into_shape_with_order((output.data.len() / ROW_SIZE, ROW_SIZE))
            .map_err(|e| PipelineError::MalformedOutput(e.to_string()))?;

        for row in rows.axis_iter(Axis(0)) {
            let imgid = row[0] as i32;
            let conf = row[2];
            // imgid < 0 或置信度为 0 标志有效行结束
            if imgid < 0 || conf == 0.0 {
                break;
            }
            let Some(tag) = tags.get(imgid as usize) else {
                tracing::debug!(imgid, count = tags.len(), "SSD 行图像下标越界, 跳过");
                continue;
            };
            if conf < self.config.conf_threshold {
                continue;
            }
            let bbox = BBox::new(row[3], row[4], row[5], row[6]).clamped();
            let image = &mut per_image[imgid as usize];
            let roi_tag = Tag::new(tag.channel, tag.frame, image.len() as u32);
            image.push(Buffer::roi(bbox, row[1] as i32, conf, roi_tag));
        }

        Ok(per_image.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind;
    use ndarray::{ArrayD, IxDyn};

    fn tensor(rows: &[[f32; 7]]) -> OutputTensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        OutputTensor::new(
            "detection_out",
            ArrayD::from_shape_vec(IxDyn(&[1, 1, rows.len(), 7]), flat).unwrap(),
        )
    }

    fn post() -> SsdPostprocessor {
        SsdPostprocessor::new(SsdConfig {
            conf_threshold: 0.5,
        })
    }

    #[test]
    fn test_config_default() {
        assert_eq!(SsdConfig::default().conf_threshold, 0.8);
    }

    #[test]
    fn test_rows_grouped_and_reindexed() {
        let out = tensor(&[
            [1.0, 15.0, 0.9, 0.1, 0.1, 0.2, 0.2],
            [0.0, 7.0, 0.8, -0.1, 0.3, 0.5, 1.2],
            [1.0, 2.0, 0.7, 0.4, 0.4, 0.6, 0.6],
            [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 3.0, 0.99, 0.0, 0.0, 1.0, 1.0],
        ]);
        let tags = [Tag::new(4, 10, 0), Tag::new(5, 11, 0)];
        let results = post().translate(&[out], &tags).unwrap();
        let summary: Vec<(u32, u32, u32)> = results
            .iter()
            .map(|b| (b.channel(), b.frame(), b.roi_index()))
            .collect();
        assert_eq!(summary, vec![(4, 10, 0), (5, 11, 0), (5, 11, 1)]);

        match results[0].kind() {
            BufferKind::DetectionBox(det) => {
                assert_eq!(det.class_id, 7);
                assert_eq!(det.bbox, BBox::new(0.0, 0.3, 0.5, 1.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_low_confidence_and_out_of_range_skipped() {
        let out = tensor(&[
            [0.0, 1.0, 0.3, 0.1, 0.1, 0.2, 0.2],
            [5.0, 1.0, 0.9, 0.1, 0.1, 0.2, 0.2],
            [0.0, 1.0, 0.6, 0.1, 0.1, 0.2, 0.2],
        ]);
        let results = post().translate(&[out], &[Tag::new(0, 0, 0)]).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_bad_shape() {
        let out = OutputTensor::new("x", ArrayD::zeros(IxDyn(&[1, 1, 2, 5])));
        assert!(post().translate(&[out], &[Tag::default()]).is_err());
    }
}
