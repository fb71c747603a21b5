// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线错误类型

use thiserror::Error;

/// 流水线统一错误类型
///
/// 容量类条件(无空闲Pin、无空闲批次槽位、无空闲Packet)不走这里,
/// 而是通过 `Option` / 状态枚举返回,属于正常流控。
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("模型加载失败: {0}")]
    ModelLoad(String),

    #[error("后端执行错误: {0}")]
    Backend(String),

    #[error("Stage '{stage}' 准备失败: {reason}")]
    Prepare { stage: String, reason: String },

    #[error("生命周期错误: Stage '{stage}' 当前状态 {state}, 无法执行 {op}")]
    Lifecycle {
        stage: String,
        state: String,
        op: &'static str,
    },

    #[error("模型输出格式错误: {0}")]
    MalformedOutput(String),

    #[error("输入不符合模型要求: {0}")]
    InvalidInput(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("JSON解析错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
