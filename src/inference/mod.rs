// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 推理模块
///
/// - `backend`: 模型执行后端接口
/// - `executor`: 批处理执行器 (槽位池 + 顺序回收)
/// - `ordering`: 输出排序协调器
/// - `stage`: 驱动执行器的 Stage
/// - `simulated`: 确定性模拟后端
pub mod backend;
pub mod executor;
pub mod ordering;
pub mod simulated;
pub mod stage;

pub use backend::{InputRequirements, ModelBackend, ModelInfo, OutputInfo, OutputTensor, SlotStatus};
pub use executor::{BatchExecutor, ExecutorOutput, InsertOutcome, OutputStatus};
pub use ordering::{Merge, OrderingCoordinator};
pub use simulated::{SimulatedBackend, SimulatedConfig};
pub use stage::{InferenceOptions, InferenceStage};
