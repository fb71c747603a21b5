// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! Stage: 单线程工作单元
//!
//! 生命周期 `Created → Prepared → Running → Stopping → Joined`。
//! 具体行为由 [`StageLogic`] 提供; 线程循环调用 `run_loop`,
//! 每轮开始检查停止标志, 阻塞等待由 Pin 断开唤醒。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::CleanerHandle;
use crate::connector::Pin;
use crate::error::{PipelineError, Result};
use crate::packet::Packet;
use crate::stats::Statistics;

/// Stage 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Created,
    Prepared,
    Running,
    Stopping,
    Joined,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `run_loop` 的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    /// 正常结束 (输入关闭 / 输出不可用)
    Finish,
}

/// 具体 Stage 的行为
pub trait StageLogic: Send {
    /// 一次性初始化, 失败时流水线不启动该 Stage
    fn prepare(&mut self, _ctx: &mut StageContext) -> Result<()> {
        Ok(())
    }

    fn run_loop(&mut self, ctx: &mut StageContext) -> LoopControl;

    /// 线程退出前调用
    fn finish(&mut self, _ctx: &mut StageContext) {}
}

/// 流水线共享环境
#[derive(Clone)]
pub struct StageEnv {
    pub cleaner: CleanerHandle,
    pub stats: Arc<Statistics>,
}

impl StageEnv {
    pub fn new(cleaner: CleanerHandle, stats: Arc<Statistics>) -> Self {
        Self { cleaner, stats }
    }

    /// 独立环境 (无后台清理线程), 测试使用
    pub fn detached() -> Self {
        Self::new(CleanerHandle::detached(), Statistics::new())
    }
}

/// 传给 `StageLogic` 的上下文
pub struct StageContext {
    name: String,
    input: Option<Arc<dyn Pin>>,
    output: Option<Arc<dyn Pin>>,
    stop: Arc<AtomicBool>,
    env: StageEnv,
}

impl StageContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cleaner(&self) -> &CleanerHandle {
        &self.env.cleaner
    }

    pub fn stats(&self) -> &Statistics {
        &self.env.stats
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// 阻塞获取输入 Packet
    pub fn acquire_input(&self) -> Option<Packet> {
        self.input.as_ref()?.get()
    }

    pub fn acquire_input_timeout(&self, timeout: Duration) -> Option<Packet> {
        self.input.as_ref()?.get_timeout(timeout)
    }

    /// 输入端不会再有数据
    pub fn input_closed(&self) -> bool {
        self.input.as_ref().map(|p| p.is_closed()).unwrap_or(true)
    }

    /// 释放剩余 Buffer 后归还输入 Packet
    pub fn release_input(&self, mut packet: Packet) {
        for buffer in packet.drain() {
            buffer.force_release(self.cleaner());
        }
        if let Some(pin) = &self.input {
            pin.store(packet);
        }
    }

    /// 获取空的输出 Packet
    ///
    /// 拿到非空 Packet 属于协议错误, 返回 None, Stage 应结束
    pub fn dequeue_output(&self) -> Option<Packet> {
        let packet = self.output.as_ref()?.get()?;
        if !packet.is_empty() {
            tracing::error!(stage = %self.name, len = packet.len(), "❌ 输出 Packet 非空");
            return None;
        }
        Some(packet)
    }

    pub fn enqueue_output(&self, packet: Packet) {
        match &self.output {
            Some(pin) => pin.store(packet),
            None => {
                tracing::warn!(stage = %self.name, "⚠️ 无输出 Pin, Packet 已丢弃");
                let mut packet = packet;
                for buffer in packet.drain() {
                    buffer.force_release(self.cleaner());
                }
            }
        }
    }

    pub fn disconnect_pins(&self) {
        if let Some(pin) = &self.input {
            pin.disconnect();
        }
        if let Some(pin) = &self.output {
            pin.disconnect();
        }
    }
}

/// 工作线程句柄
pub struct Stage {
    name: String,
    state: StageState,
    logic: Option<Box<dyn StageLogic>>,
    input: Option<Arc<dyn Pin>>,
    output: Option<Arc<dyn Pin>>,
    stop: Arc<AtomicBool>,
    env: StageEnv,
    ctx: Option<StageContext>,
    worker: Option<JoinHandle<()>>,
}

impl Stage {
    pub fn new(name: &str, logic: Box<dyn StageLogic>, env: StageEnv) -> Self {
        Self {
            name: name.to_string(),
            state: StageState::Created,
            logic: Some(logic),
            input: None,
            output: None,
            stop: Arc::new(AtomicBool::new(false)),
            env,
            ctx: None,
            worker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    fn lifecycle_error(&self, op: &'static str) -> PipelineError {
        PipelineError::Lifecycle {
            stage: self.name.clone(),
            state: self.state.to_string(),
            op,
        }
    }

    pub fn connect_input(&mut self, pin: Arc<dyn Pin>) -> Result<()> {
        if self.state != StageState::Created {
            return Err(self.lifecycle_error("connect_input"));
        }
        self.input = Some(pin);
        Ok(())
    }

    pub fn connect_output(&mut self, pin: Arc<dyn Pin>) -> Result<()> {
        if self.state != StageState::Created {
            return Err(self.lifecycle_error("connect_output"));
        }
        self.output = Some(pin);
        Ok(())
    }

    /// 一次性初始化, 必须在 `run` 之前调用
    pub fn prepare(&mut self) -> Result<()> {
        if self.state != StageState::Created {
            return Err(self.lifecycle_error("prepare"));
        }
        let mut ctx = StageContext {
            name: self.name.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            stop: self.stop.clone(),
            env: self.env.clone(),
        };
        let logic = self
            .logic
            .as_mut()
            .ok_or_else(|| self_missing_logic(&self.name))?;
        logic.prepare(&mut ctx).map_err(|e| PipelineError::Prepare {
            stage: self.name.clone(),
            reason: e.to_string(),
        })?;
        self.ctx = Some(ctx);
        self.state = StageState::Prepared;
        tracing::info!(stage = %self.name, "✅ stage prepared");
        Ok(())
    }

    /// 启动工作线程
    pub fn run(&mut self) -> Result<()> {
        if self.state != StageState::Prepared {
            return Err(self.lifecycle_error("run"));
        }
        let (Some(mut logic), Some(mut ctx)) = (self.logic.take(), self.ctx.take()) else {
            return Err(self_missing_logic(&self.name));
        };
        let name = self.name.clone();
        let worker = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                tracing::info!(stage = %name, "🚀 stage running");
                let mut loops: u64 = 0;
                while !ctx.is_stopped() {
                    loops += 1;
                    if logic.run_loop(&mut ctx) == LoopControl::Finish {
                        break;
                    }
                }
                logic.finish(&mut ctx);
                ctx.disconnect_pins();
                tracing::info!(stage = %name, loops, "🛑 stage exited");
            })?;
        self.worker = Some(worker);
        self.state = StageState::Running;
        Ok(())
    }

    /// 协作式停止: 置位标志并断开 Pin 唤醒阻塞的等待
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(pin) = &self.input {
            pin.disconnect();
        }
        if let Some(pin) = &self.output {
            pin.disconnect();
        }
        if self.state == StageState::Running {
            self.state = StageState::Stopping;
        }
    }

    /// 等待工作线程退出
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(stage = %self.name, "❌ stage thread panicked");
            }
        }
        self.state = StageState::Joined;
    }

    /// 工作线程是否已经结束
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map(|w| w.is_finished()).unwrap_or(true)
    }
}

fn self_missing_logic(name: &str) -> PipelineError {
    PipelineError::Lifecycle {
        stage: name.to_string(),
        state: "consumed".to_string(),
        op: "logic",
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
            self.join();
        }
    }
}
