#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod buffer; // 带引用计数的数据单元与清理队列
pub mod config; // 命令行与 JSON 配置
pub mod connector; // Stage 之间的有界交接
pub mod crop; // ROI 裁剪
pub mod detection; // 检测框与非极大值抑制
pub mod error; // 错误类型
pub mod inference; // 批处理执行器与推理 Stage
pub mod models; // 模型后处理
pub mod packet; // Stage 间传递的 Buffer 序列
pub mod pipeline; // 流水线根对象
pub mod source; // 帧源
pub mod stage; // Stage 生命周期
pub mod stats; // 运行统计
pub mod utils; // 工具函数

pub use crate::buffer::{Buffer, BufferKind, Cleaner, CleanerHandle, FrameId, Geometry, PixelFormat, Tag};
pub use crate::config::{Args, PipelineConfig};
pub use crate::connector::{Connector, CsvWriterPin, DispatchPolicy, Pin, SinkPin};
pub use crate::error::{PipelineError, Result};
pub use crate::inference::{BatchExecutor, InferenceStage, InsertOutcome, OrderingCoordinator, OutputStatus};
pub use crate::models::{ModelKind, Postprocessor};
pub use crate::packet::Packet;
pub use crate::pipeline::Pipeline;
pub use crate::stage::{LoopControl, Stage, StageContext, StageLogic, StageState};
pub use crate::stats::{StatKind, Statistics};
