// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 非极大值抑制, 两种可互换策略

use serde::{Deserialize, Serialize};

use super::types::Detection;

/// 抑制策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionPolicy {
    /// 同类且置信度更高、IoU >= 阈值的框存在时排除, O(n²), 保持原顺序
    Exclusion,
    /// 按置信度降序贪心抑制, 不区分类别
    Greedy,
}

impl Default for SuppressionPolicy {
    fn default() -> Self {
        SuppressionPolicy::Exclusion
    }
}

pub fn suppress(detections: Vec<Detection>, policy: SuppressionPolicy, iou_threshold: f32) -> Vec<Detection> {
    match policy {
        SuppressionPolicy::Exclusion => suppress_exclusion(detections, iou_threshold),
        SuppressionPolicy::Greedy => suppress_greedy(detections, iou_threshold),
    }
}

/// 排除式抑制
///
/// 置信度严格小于 (`<`) 才会被排除, 置信度相同的重叠框都保留。
pub fn suppress_exclusion(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let keep: Vec<bool> = detections
        .iter()
        .map(|d1| {
            !detections.iter().any(|d2| {
                d1.class_id == d2.class_id
                    && d1.confidence < d2.confidence
                    && d1.bbox.iou(&d2.bbox) >= iou_threshold
            })
        })
        .collect();
    detections
        .into_iter()
        .zip(keep)
        .filter_map(|(d, k)| k.then_some(d))
        .collect()
}

/// 贪心抑制
///
/// 稳定降序排序后依次保留, 被保留框压制 (IoU >= 阈值) 的后续框记入独立的
/// 抑制标记, 不修改原始置信度。置信度为 0 的框直接跳过。
pub fn suppress_greedy(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut suppressed = vec![false; detections.len()];
    let mut kept = Vec::new();
    for i in 0..detections.len() {
        if suppressed[i] || detections[i].confidence == 0.0 {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && detections[i].bbox.iou(&detections[j].bbox) >= iou_threshold {
                suppressed[j] = true;
            }
        }
        kept.push(detections[i]);
    }
    kept
}
