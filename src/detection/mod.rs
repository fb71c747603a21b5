// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测框与抑制算法 (Detection boxes & suppression)
///
/// - types: 归一化检测框、IoU
/// - nms:   排除式 / 贪心式非极大值抑制
pub mod nms;
pub mod types;

pub use nms::{suppress, suppress_exclusion, suppress_greedy, SuppressionPolicy};
pub use types::{BBox, Detection};
