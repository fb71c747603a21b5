// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线配置 - 命令行参数与 JSON 配置文件
//!
//! 先加载 `--config` 指定的 JSON (没有则用默认值), 再用命令行中显式给出的参数覆盖。

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::detection::SuppressionPolicy;
use crate::error::{PipelineError, Result};
use crate::models::ModelKind;

/// 流水线参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    // === 输入 ===
    pub input: Option<PathBuf>, // 平面 RGBP 原始帧文件, 为空时生成合成画面
    pub channels: u32,          // 通道数
    pub width: Option<u32>,     // 帧宽, 为空时取模型输入宽度
    pub height: Option<u32>,    // 帧高
    pub fps: f32,               // 每通道帧率, 0 表示不限速
    pub max_frames: u32,        // 每通道帧数, 0 表示不限

    // === 模型 ===
    pub model: ModelKind,
    pub classify: bool,         // 检测后追加裁剪 + 分类
    pub batch_size: usize,
    pub nireq: usize,           // 同时在途的批次数
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub suppression: SuppressionPolicy,
    pub latency_ms: u64,        // 模拟后端单批延迟
    pub flush_timeout_ms: u64,  // 未满批次的最长等待, 0 表示只在输入结束时提交

    // === 调度 ===
    pub workers: usize,         // 推理 Stage 数 (按通道分片)
    pub buffers: usize,         // 每个 Pin 的 Packet 数
    pub keep_aspect_ratio: bool,

    // === 运行 ===
    pub duration_secs: Option<u64>,
    pub report_interval_secs: f32,
    pub output_csv: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: None,
            channels: 1,
            width: None,
            height: None,
            fps: 0.0,
            max_frames: 100,

            model: ModelKind::Ssd,
            classify: false,
            batch_size: 1,
            nireq: 1,
            conf_threshold: 0.8,
            iou_threshold: 0.5,
            suppression: SuppressionPolicy::Exclusion,
            latency_ms: 5,
            flush_timeout_ms: 50,

            workers: 1,
            buffers: 4,
            keep_aspect_ratio: false,

            duration_secs: None,
            report_interval_secs: 1.0,
            output_csv: None,
        }
    }
}

impl PipelineConfig {
    /// 从 JSON 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        tracing::info!(path = %path.display(), "✅ 配置已加载");
        Ok(config)
    }

    /// 保存配置到 JSON 文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        tracing::info!(path = %path.display(), "💾 配置已保存");
        Ok(())
    }

    /// 源帧尺寸, 未指定时与模型输入一致
    pub fn frame_size(&self) -> (u32, u32) {
        let (w, h) = self.model.default_input_size();
        (self.width.unwrap_or(w), self.height.unwrap_or(h))
    }

    pub fn validate(&self) -> Result<()> {
        let (w, h) = self.frame_size();
        let checks = [
            (self.channels == 0, "channels 必须大于 0"),
            (w == 0 || h == 0, "帧尺寸必须大于 0"),
            (self.batch_size == 0, "batch_size 必须大于 0"),
            (self.nireq == 0, "nireq 必须大于 0"),
            (self.workers == 0, "workers 必须大于 0"),
            (self.buffers == 0, "buffers 必须大于 0"),
            (!(0.0..=1.0).contains(&self.conf_threshold), "conf_threshold 超出 [0, 1]"),
            (!(0.0..=1.0).contains(&self.iou_threshold), "iou_threshold 超出 [0, 1]"),
            (self.fps < 0.0, "fps 不能为负"),
            (self.classify && !self.model.is_detector(), "分类级联需要检测模型"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(PipelineError::Config(reason.to_string())),
            None => Ok(()),
        }
    }
}

/// 命令行参数; 省略的参数沿用配置文件或默认值
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "视频分析流水线 - 批处理推理调度", long_about = None)]
pub struct Args {
    /// 平面 RGBP 原始帧文件 (不指定则生成合成画面)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// 通道数
    #[arg(short, long)]
    pub channels: Option<u32>,

    /// 帧宽
    #[arg(long)]
    pub width: Option<u32>,

    /// 帧高
    #[arg(long)]
    pub height: Option<u32>,

    /// 每通道帧率 (0 不限速)
    #[arg(long)]
    pub fps: Option<f32>,

    /// 每通道帧数 (0 不限)
    #[arg(short = 'n', long)]
    pub max_frames: Option<u32>,

    /// 模型类型
    #[arg(short, long, value_enum)]
    pub model: Option<ModelKind>,

    /// 检测后追加 ROI 分类
    #[arg(long)]
    pub classify: bool,

    /// 批大小
    #[arg(short, long)]
    pub batch: Option<usize>,

    /// 同时在途的批次数
    #[arg(long)]
    pub nireq: Option<usize>,

    /// 置信度阈值
    #[arg(long)]
    pub conf: Option<f32>,

    /// NMS IoU 阈值
    #[arg(long)]
    pub iou: Option<f32>,

    /// 抑制策略
    #[arg(long, value_enum)]
    pub nms: Option<SuppressionPolicy>,

    /// 推理 Stage 数
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// 每个 Pin 的 Packet 数
    #[arg(long)]
    pub buffers: Option<usize>,

    /// 模拟后端单批延迟 (毫秒)
    #[arg(long)]
    pub latency_ms: Option<u64>,

    /// 运行时长 (秒), 不指定则处理完所有帧
    #[arg(short, long)]
    pub duration: Option<u64>,

    /// 统计报告间隔 (秒)
    #[arg(long)]
    pub report_interval: Option<f32>,

    /// 结果 CSV 输出路径
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// JSON 配置文件
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 把生效的配置写入该文件
    #[arg(long)]
    pub save_config: Option<PathBuf>,

    /// 日志级别 (RUST_LOG 优先)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// 显式给出的参数覆盖配置
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(v) = &self.input {
            config.input = Some(v.clone());
        }
        if self.width.is_some() {
            config.width = self.width;
        }
        if self.height.is_some() {
            config.height = self.height;
        }
        if self.classify {
            config.classify = true;
        }
        if self.duration.is_some() {
            config.duration_secs = self.duration;
        }
        if let Some(v) = &self.output {
            config.output_csv = Some(v.clone());
        }
        macro_rules! set {
            ($($arg:ident => $field:ident),* $(,)?) => {
                $(if let Some(v) = self.$arg { config.$field = v; })*
            };
        }
        set!(
            channels => channels,
            fps => fps,
            max_frames => max_frames,
            model => model,
            batch => batch_size,
            nireq => nireq,
            conf => conf_threshold,
            iou => iou_threshold,
            nms => suppression,
            workers => workers,
            buffers => buffers,
            latency_ms => latency_ms,
            report_interval => report_interval_secs,
        );
    }

    /// 配置文件 + 命令行覆盖, 校验后返回
    pub fn resolve(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        if let Some(path) = &self.save_config {
            config.save(path)?;
        }
        Ok(config)
    }
}
