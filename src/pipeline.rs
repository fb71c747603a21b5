// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线根对象
//!
//! 持有清理队列、统计计数器、所有 Connector 与 Stage。
//! 所有 Stage 先全部 `prepare` 成功才会启动任何线程。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::buffer::{Cleaner, CleanerHandle};
use crate::config::PipelineConfig;
use crate::connector::{Connector, CsvWriterPin, Pin, SinkPin};
use crate::crop::{CropOptions, CropStage};
use crate::error::{PipelineError, Result};
use crate::inference::{
    BatchExecutor, InferenceOptions, InferenceStage, SimulatedBackend, SimulatedConfig,
};
use crate::models::{create_postprocessor, ModelKind};
use crate::source::{SourceOptions, SourceStage};
use crate::stage::{Stage, StageEnv, StageState};
use crate::stats::Statistics;

/// 终端: 丢弃或写 CSV
enum Terminal {
    Sink(Arc<SinkPin>),
    Csv(Arc<CsvWriterPin>),
}

impl Terminal {
    fn attach(&self) -> Arc<dyn Pin> {
        match self {
            Terminal::Sink(pin) => pin.attach(),
            Terminal::Csv(pin) => pin.attach(),
        }
    }
}

pub struct Pipeline {
    cleaner: Cleaner,
    stats: Arc<Statistics>,
    connectors: Vec<Connector>,
    stages: Vec<Stage>,
    report_stop: Arc<AtomicBool>,
    reporter: Option<JoinHandle<()>>,
    terminal: Option<Terminal>,
}

impl Pipeline {
    pub fn new() -> Result<Self> {
        Ok(Self {
            cleaner: Cleaner::start()?,
            stats: Statistics::new(),
            connectors: Vec::new(),
            stages: Vec::new(),
            report_stop: Arc::new(AtomicBool::new(false)),
            reporter: None,
            terminal: None,
        })
    }

    /// 按配置搭建流水线
    ///
    /// ```text
    /// source ─(sharded)─> detect × workers ─> sink
    /// source ─(sharded)─> detect × workers ─(fifo)─> crop ─(fifo)─> classify ─> sink
    /// ```
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let mut pipeline = Self::new()?;
        let env = pipeline.env();
        let terminal = match &config.output_csv {
            Some(path) => Terminal::Csv(CsvWriterPin::create(path, env.cleaner.clone())?),
            None => Terminal::Sink(SinkPin::new(env.cleaner.clone())),
        };

        // 每个 Buffer 的读者数: 转发它的 Stage 数 + 终端
        let forwarders = if config.classify { 3 } else { 1 };
        let (width, height) = config.frame_size();
        let source = SourceStage::new(SourceOptions {
            channels: config.channels,
            width,
            height,
            fps: config.fps,
            max_frames: config.max_frames,
            input: config.input.clone(),
            out_ref: forwarders + 1,
            pool_size: config.buffers * (config.workers + 1) * 2,
        });
        let decoded = pipeline.add_connector(Connector::sharded(
            "decoded",
            1,
            config.workers,
            config.buffers,
        ));
        let mut stage = Stage::new("va-source", Box::new(source), env.clone());
        stage.connect_output(take_pin(decoded.new_input_pin(), &decoded)?)?;
        pipeline.add_stage(stage);

        let detected = config.classify.then(|| {
            Connector::fifo("detected", config.workers, 1, config.buffers)
        });
        if let Some(conn) = &detected {
            pipeline.add_connector(conn.clone());
        }

        let flush_timeout = (config.flush_timeout_ms > 0)
            .then(|| Duration::from_millis(config.flush_timeout_ms));
        for worker in 0..config.workers {
            let executor = simulated_executor(config, config.model, (width, height));
            let logic = InferenceStage::new(
                executor,
                InferenceOptions {
                    out_ref: forwarders,
                    flush_timeout,
                    detector: true,
                },
            );
            let mut stage = Stage::new(&format!("va-detect-{}", worker), Box::new(logic), env.clone());
            stage.connect_input(take_pin(decoded.new_output_pin(), &decoded)?)?;
            match &detected {
                Some(conn) => stage.connect_output(take_pin(conn.new_input_pin(), conn)?)?,
                None => stage.connect_output(terminal.attach())?,
            }
            pipeline.add_stage(stage);
        }

        if let Some(detected) = detected {
            let (cw, ch) = ModelKind::Resnet.default_input_size();
            let crop = CropStage::new(CropOptions {
                width: cw,
                height: ch,
                keep_aspect_ratio: config.keep_aspect_ratio,
                pool_size: config.buffers * 16,
            });
            let cropped = pipeline.add_connector(Connector::fifo("cropped", 1, 1, config.buffers));
            let mut stage = Stage::new("va-crop", Box::new(crop), env.clone());
            stage.connect_input(take_pin(detected.new_output_pin(), &detected)?)?;
            stage.connect_output(take_pin(cropped.new_input_pin(), &cropped)?)?;
            pipeline.add_stage(stage);

            let executor = simulated_executor(config, ModelKind::Resnet, (cw, ch));
            let logic = InferenceStage::new(
                executor,
                InferenceOptions {
                    out_ref: 1,
                    flush_timeout,
                    detector: false,
                },
            );
            let mut stage = Stage::new("va-classify", Box::new(logic), env);
            stage.connect_input(take_pin(cropped.new_output_pin(), &cropped)?)?;
            stage.connect_output(terminal.attach())?;
            pipeline.add_stage(stage);
        }

        pipeline.terminal = Some(terminal);
        tracing::info!(
            stages = pipeline.stages.len(),
            connectors = pipeline.connectors.len(),
            model = ?config.model,
            classify = config.classify,
            "🔧 pipeline assembled"
        );
        Ok(pipeline)
    }

    /// CSV 已写入的行数
    pub fn rows_written(&self) -> u64 {
        match &self.terminal {
            Some(Terminal::Csv(pin)) => pin.rows_written(),
            _ => 0,
        }
    }

    /// 终端丢弃的 Packet 数
    pub fn packets_consumed(&self) -> u64 {
        match &self.terminal {
            Some(Terminal::Sink(pin)) => pin.consumed(),
            _ => 0,
        }
    }

    /// 供 Stage 使用的共享环境
    pub fn env(&self) -> StageEnv {
        StageEnv::new(self.cleaner.handle(), self.stats.clone())
    }

    pub fn cleaner(&self) -> CleanerHandle {
        self.cleaner.handle()
    }

    pub fn stats(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    /// 添加 Connector, 其丢弃的 Buffer 交给本流水线的清理队列
    pub fn add_connector(&mut self, connector: Connector) -> Connector {
        connector.set_cleaner(self.cleaner.handle());
        self.connectors.push(connector.clone());
        connector
    }

    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    /// 添加 Stage, 返回下标
    pub fn add_stage(&mut self, stage: Stage) -> usize {
        self.stages.push(stage);
        self.stages.len() - 1
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// 准备全部 Stage, 任一失败立即返回, 不启动任何线程
    pub fn prepare_all(&mut self) -> Result<()> {
        for stage in &mut self.stages {
            if stage.state() == StageState::Created {
                stage.prepare()?;
            }
        }
        Ok(())
    }

    /// 启动全部 Stage
    pub fn run_all(&mut self) -> Result<()> {
        self.prepare_all()?;
        for i in 0..self.stages.len() {
            if let Err(e) = self.stages[i].run() {
                tracing::error!(stage = self.stages[i].name(), error = %e, "❌ stage failed to start");
                self.stop_all();
                return Err(e);
            }
        }
        tracing::info!(stages = self.stages.len(), "🚀 pipeline running");
        Ok(())
    }

    /// 立即停止: 先置位所有停止标志, 再逐个等待
    pub fn stop_all(&mut self) {
        for stage in &mut self.stages {
            stage.stop();
        }
        self.join_all();
    }

    pub fn join_all(&mut self) {
        for stage in &mut self.stages {
            stage.join();
        }
    }

    /// 平滑结束: 只停止源 Stage, 下游在输入关闭后处理完剩余数据自行退出
    pub fn drain(&mut self) {
        for stage in &mut self.stages {
            if !stage.has_input() {
                stage.stop();
            }
        }
        self.join_all();
    }

    pub fn all_finished(&self) -> bool {
        self.stages.iter().all(|s| s.is_finished())
    }

    /// 运行指定时长 (None 表示直到所有 Stage 自行结束), 可选周期报告
    pub fn run_for(&mut self, duration: Option<Duration>, report: Option<Duration>) -> Result<()> {
        self.run_all()?;
        if let Some(period) = report {
            self.report_stop.store(false, Ordering::Release);
            self.reporter = Some(
                self.stats
                    .report_periodically(period, self.report_stop.clone())?,
            );
        }
        let start = Instant::now();
        while !self.all_finished() {
            if duration.is_some_and(|d| start.elapsed() >= d) {
                tracing::info!("⏱️ run duration reached, draining");
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.drain();
        self.stop_reporter();
        self.stats.update();
        self.stats.report();
        Ok(())
    }

    fn stop_reporter(&mut self) {
        self.report_stop.store(true, Ordering::Release);
        if let Some(handle) = self.reporter.take() {
            let _ = handle.join();
        }
    }

    /// 停止全部 Stage 与后台线程, 清空清理队列
    pub fn shutdown(&mut self) {
        self.stop_all();
        self.stop_reporter();
        self.cleaner.shutdown();
        tracing::info!(
            destroyed = self.cleaner.handle().destroyed_count(),
            "pipeline shut down"
        );
    }
}

fn take_pin<P: Pin + 'static>(pin: Option<Arc<P>>, conn: &Connector) -> Result<Arc<dyn Pin>> {
    match pin {
        Some(pin) => Ok(pin as Arc<dyn Pin>),
        None => Err(PipelineError::Config(format!("connector '{}' 没有空闲 Pin", conn.name()))),
    }
}

fn simulated_executor(config: &PipelineConfig, kind: ModelKind, size: (u32, u32)) -> BatchExecutor {
    let backend = SimulatedBackend::new(SimulatedConfig {
        width: size.0,
        height: size.1,
        latency: Duration::from_millis(config.latency_ms),
        ..SimulatedConfig::new(kind)
    });
    BatchExecutor::new(
        Box::new(backend),
        create_postprocessor(kind, config),
        config.batch_size,
        config.nireq,
    )
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop_all();
        self.stop_reporter();
    }
}
