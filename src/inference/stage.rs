// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理 Stage
//!
//! 从输入 Packet 中挑出符合模型输入要求的表面送入批处理执行器,
//! 其余 Buffer 随 Packet 一起转发; 执行结果经排序协调器按到达顺序输出。

use std::time::{Duration, Instant};

use super::backend::InputRequirements;
use super::executor::{BatchExecutor, ExecutorOutput, InsertOutcome, OutputStatus};
use super::ordering::OrderingCoordinator;
use crate::buffer::{Buffer, BufferKind};
use crate::error::Result;
use crate::packet::Packet;
use crate::stage::{LoopControl, StageContext, StageLogic};
use crate::stats::StatKind;

/// 有执行中的批次时, 等待输入的时长
const BUSY_POLL: Duration = Duration::from_millis(2);

/// 推理 Stage 配置
#[derive(Debug, Clone)]
pub struct InferenceOptions {
    /// 新结果 Buffer 的下游读者数
    pub out_ref: i32,
    /// 批次累积超过该时长仍未满时提前提交
    pub flush_timeout: Option<Duration>,
    /// 结果计入检测统计 (否则计入分类统计)
    pub detector: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            out_ref: 1,
            flush_timeout: Some(Duration::from_millis(50)),
            detector: true,
        }
    }
}

pub struct InferenceStage {
    executor: BatchExecutor,
    options: InferenceOptions,
    requirements: Option<InputRequirements>,
    coordinator: OrderingCoordinator<Packet>,
    output: ExecutorOutput,
    // 当前批次第一张图像的插入时间
    accumulating_since: Option<Instant>,
}

impl InferenceStage {
    pub fn new(executor: BatchExecutor, options: InferenceOptions) -> Self {
        Self {
            executor,
            options,
            requirements: None,
            coordinator: OrderingCoordinator::new(),
            output: ExecutorOutput::default(),
            accumulating_since: None,
        }
    }

    /// 该 Buffer 是否需要送入模型
    fn can_be_processed(&self, buffer: &Buffer) -> bool {
        let Some(req) = &self.requirements else {
            return false;
        };
        match buffer.kind() {
            BufferKind::AcceleratorSurface(_) | BufferKind::HostSurface(_) => buffer
                .geometry()
                .map(|g| req.accepts(g.width, g.height, g.pitch, g.format))
                .unwrap_or(false),
            _ => false,
        }
    }

    fn step_received(&self, ctx: &StageContext) {
        ctx.stats().step(StatKind::InferenceFramesReceived);
        ctx.stats().step(if self.options.detector {
            StatKind::DetectionsReceived
        } else {
            StatKind::ClassificationsReceived
        });
    }

    fn step_processed(&self, ctx: &StageContext) {
        ctx.stats().step(StatKind::InferenceFramesProcessed);
        ctx.stats().step(if self.options.detector {
            StatKind::DetectionsProcessed
        } else {
            StatKind::ClassificationsProcessed
        });
    }

    /// 回收执行结果并输出已完成的 Packet; 输出不可用时返回 false
    fn collect(&mut self, ctx: &StageContext) -> (OutputStatus, bool) {
        let status = self.executor.get_output(&mut self.output);
        if self.executor.batch_index() == 0 {
            self.accumulating_since = None;
        }

        let cleaner = ctx.cleaner();
        for result in self.output.results.drain(..) {
            result.set_ref(self.options.out_ref);
            match self.coordinator.record_mut(&result.frame_id()) {
                Some(packet) => packet.push(result),
                None => {
                    tracing::warn!(stage = %ctx.name(), frame = %result.frame_id(), "⚠️ 结果没有对应的帧, 丢弃");
                    result.force_release(cleaner);
                }
            }
        }

        let completed: Vec<_> = self.output.completed.drain(..).collect();
        for tag in completed {
            self.step_processed(ctx);
            for packet in self.coordinator.complete_one(&tag.frame_id()) {
                if !emit(ctx, packet) {
                    return (status, false);
                }
            }
        }
        (status, true)
    }

    /// 处理一个输入 Packet; 输出不可用时返回 false
    fn process(&mut self, ctx: &StageContext, mut input: Packet) -> bool {
        let Some(id) = input.frame_id() else {
            ctx.release_input(input);
            return true;
        };
        let buffers: Vec<Buffer> = input.drain().collect();
        ctx.release_input(input);

        let cleaner = ctx.cleaner();
        let mut payload = Packet::new();
        let mut exec_count = 0;
        for buffer in buffers {
            if self.can_be_processed(&buffer) {
                match self.executor.insert_image_until(&buffer, buffer.tag(), || ctx.is_stopped()) {
                    Ok(InsertOutcome::NoFreeSlot) => {
                        tracing::debug!(stage = %ctx.name(), tag = ?buffer.tag(), "stopped while waiting for a slot");
                    }
                    Ok(_) => {
                        exec_count += 1;
                        self.step_received(ctx);
                        if self.accumulating_since.is_none() {
                            self.accumulating_since = Some(Instant::now());
                        }
                    }
                    Err(e) => {
                        tracing::error!(stage = %ctx.name(), tag = ?buffer.tag(), error = %e, "❌ 插入图像失败");
                    }
                }
            }
            buffer.unref_into(cleaner, &mut payload);
        }

        match self.coordinator.submit(id, payload, exec_count) {
            Some(packet) => {
                tracing::trace!(stage = %ctx.name(), frame = %id, "直接输出");
                emit(ctx, packet)
            }
            None => true,
        }
    }

    /// 输入结束: 提交残余批次, 等待全部完成后输出
    fn drain_executor(&mut self, ctx: &StageContext) -> LoopControl {
        self.executor.flush();
        while self.executor.in_flight() > 0 && !ctx.is_stopped() {
            if !self.executor.wait_timeout(BUSY_POLL) {
                continue;
            }
            if !self.collect(ctx).1 {
                return LoopControl::Finish;
            }
        }
        if !self.collect(ctx).1 {
            return LoopControl::Finish;
        }
        for packet in self.coordinator.drain_all() {
            if !emit(ctx, packet) {
                break;
            }
        }
        tracing::info!(stage = %ctx.name(), "✅ 输入结束, 推理结果已全部输出");
        LoopControl::Finish
    }
}

impl StageLogic for InferenceStage {
    fn prepare(&mut self, ctx: &mut StageContext) -> Result<()> {
        self.executor.load()?;
        let req = self.executor.requirements();
        tracing::info!(
            stage = %ctx.name(),
            width = req.width,
            height = req.height,
            format = ?req.format,
            "📐 input requirements"
        );
        self.requirements = Some(req);
        Ok(())
    }

    fn run_loop(&mut self, ctx: &mut StageContext) -> LoopControl {
        let (status, ok) = self.collect(ctx);
        if !ok {
            return LoopControl::Finish;
        }

        // 没有空闲槽位: 等最早的批次完成再取输入
        if status == OutputStatus::AllBusy {
            self.executor.wait_timeout(BUSY_POLL);
            return LoopControl::Continue;
        }

        let busy = self.executor.in_flight() > 0
            || self.executor.batch_index() > 0
            || !self.coordinator.is_empty();
        let input = if busy {
            let timeout = match (self.options.flush_timeout, self.accumulating_since) {
                (Some(limit), Some(since)) if self.executor.in_flight() == 0 => {
                    limit.saturating_sub(since.elapsed()).max(Duration::from_millis(1))
                }
                _ => BUSY_POLL,
            };
            ctx.acquire_input_timeout(timeout)
        } else {
            ctx.acquire_input()
        };

        match input {
            Some(packet) => {
                if !self.process(ctx, packet) {
                    return LoopControl::Finish;
                }
            }
            None if ctx.input_closed() => return self.drain_executor(ctx),
            None => {
                if let (Some(limit), Some(since)) = (self.options.flush_timeout, self.accumulating_since) {
                    if since.elapsed() >= limit && self.executor.flush() {
                        tracing::debug!(stage = %ctx.name(), "partial batch flushed");
                        self.accumulating_since = None;
                    }
                }
            }
        }
        LoopControl::Continue
    }

    fn finish(&mut self, ctx: &mut StageContext) {
        // 停止时把暂存的 Buffer 交给清理队列
        let cleaner = ctx.cleaner();
        for mut packet in self.coordinator.drain_all() {
            for buffer in packet.drain() {
                buffer.force_release(cleaner);
            }
        }
    }
}

/// 取一个空输出 Packet 装入内容并入队; 输出不可用时释放内容
fn emit(ctx: &StageContext, mut packet: Packet) -> bool {
    match ctx.dequeue_output() {
        Some(mut out) => {
            out.extend(packet.drain());
            ctx.enqueue_output(out);
            true
        }
        None => {
            for buffer in packet.drain() {
                buffer.force_release(ctx.cleaner());
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Geometry, PixelFormat, Tag};
    use crate::connector::{Connector, Pin};
    use crate::inference::simulated::{SimulatedBackend, SimulatedConfig};
    use crate::models::{ModelKind, SsdConfig, SsdPostprocessor};
    use crate::stage::{Stage, StageEnv};
    use std::sync::Arc;

    fn frame(w: u32, h: u32, channel: u32, frame: u32) -> Buffer {
        let g = Geometry::packed(w, h, PixelFormat::Rgbp);
        Buffer::host_surface(Arc::new(vec![200; g.frame_bytes()]), g, Tag::new(channel, frame, 0))
    }

    fn ssd_stage(batch: usize) -> InferenceStage {
        let backend = SimulatedBackend::new(SimulatedConfig::new(ModelKind::Ssd));
        let executor = BatchExecutor::new(
            Box::new(backend),
            Box::new(SsdPostprocessor::new(SsdConfig::default())),
            batch,
            2,
        );
        InferenceStage::new(executor, InferenceOptions::default())
    }

    #[test]
    fn test_order_preserved_with_bypass_frames() {
        let env = StageEnv::detached();
        let upstream = Connector::fifo("decoded", 1, 1, 8);
        let downstream = Connector::fifo("detected", 1, 1, 8);
        let producer = upstream.new_input_pin().unwrap();
        let consumer = downstream.new_output_pin().unwrap();

        let mut stage = Stage::new("infer", Box::new(ssd_stage(2)), env.clone());
        stage.connect_input(upstream.new_output_pin().unwrap()).unwrap();
        stage.connect_output(downstream.new_input_pin().unwrap()).unwrap();
        stage.prepare().unwrap();
        stage.run().unwrap();

        // 奇数帧尺寸不符, 不需要推理, 但必须保持原有顺序
        for f in 0..6u32 {
            let (w, h) = if f % 2 == 0 { (300, 300) } else { (64, 64) };
            let b = frame(w, h, 0, f);
            b.set_ref(2);
            let mut p = producer.get().unwrap();
            p.push(b);
            producer.store(p);
        }
        producer.disconnect();

        let mut frames = Vec::new();
        let mut detections = 0;
        while let Some(mut p) = consumer.get_timeout(Duration::from_secs(5)) {
            if p.is_empty() {
                consumer.store(p);
                continue;
            }
            frames.push(p.frame_id().unwrap().frame);
            detections += p
                .iter()
                .filter(|b| matches!(b.kind(), BufferKind::DetectionBox(_)))
                .count();
            p.clear();
            consumer.store(p);
            if frames.len() == 6 {
                break;
            }
        }
        stage.join();
        assert_eq!(frames, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(detections, 3);
        assert_eq!(env.stats.total(StatKind::InferenceFramesReceived), 3);
        assert_eq!(env.stats.total(StatKind::InferenceFramesProcessed), 3);
    }

    #[test]
    fn test_can_be_processed_requires_prepare() {
        let stage = ssd_stage(1);
        assert!(!stage.can_be_processed(&frame(300, 300, 0, 0)));
    }
}
