// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 帧源 Stage (代替解码器)
//!
//! 按通道轮转输出平面 RGBP 主机表面, 帧数据来自原始帧文件 (循环读取)
//! 或合成画面。每帧的计数单元来自本 Stage 的 `RefPool`,
//! 池满时轮询等待下游释放, 形成对解码端的反压。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use crate::buffer::{planar_rgb, Buffer, Geometry, PixelFormat, RefPool, Tag};
use crate::error::{PipelineError, Result};
use crate::stage::{LoopControl, StageContext, StageLogic};
use crate::stats::StatKind;

/// 每个通道的合成画面数
const SYNTHETIC_FRAMES: usize = 4;

/// 帧源配置
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub channels: u32,
    pub width: u32,
    pub height: u32,
    /// 每通道帧率, 0 表示不限速
    pub fps: f32,
    /// 每通道帧数, 0 表示不限
    pub max_frames: u32,
    pub input: Option<PathBuf>,
    /// 每帧的下游读者数
    pub out_ref: i32,
    /// 同时在途的帧数
    pub pool_size: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            channels: 1,
            width: 300,
            height: 300,
            fps: 0.0,
            max_frames: 0,
            input: None,
            out_ref: 1,
            pool_size: 16,
        }
    }
}

pub struct SourceStage {
    options: SourceOptions,
    geometry: Geometry,
    pool: Arc<RefPool>,
    // frames[channel] 为该通道循环使用的帧
    frames: Vec<Vec<Arc<Vec<u8>>>>,
    counters: Vec<u32>,
    next_channel: usize,
    next_due: Option<Instant>,
}

impl SourceStage {
    pub fn new(options: SourceOptions) -> Self {
        let geometry = Geometry::packed(options.width, options.height, PixelFormat::Rgbp);
        let pool = RefPool::new(options.pool_size.max(1));
        Self {
            counters: vec![0; options.channels as usize],
            options,
            geometry,
            pool,
            frames: Vec::new(),
            next_channel: 0,
            next_due: None,
        }
    }

    pub fn pool(&self) -> &Arc<RefPool> {
        &self.pool
    }

    /// 原始帧文件按整帧切分, 所有通道共用
    fn load_raw(&self, path: &PathBuf) -> Result<Vec<Arc<Vec<u8>>>> {
        let data = std::fs::read(path)?;
        let frame_bytes = self.geometry.frame_bytes();
        if frame_bytes == 0 || data.len() < frame_bytes {
            return Err(PipelineError::InvalidInput(format!(
                "{} 大小 {} 字节, 不足一帧 ({} 字节)",
                path.display(),
                data.len(),
                frame_bytes
            )));
        }
        if data.len() % frame_bytes != 0 {
            tracing::warn!(path = %path.display(), "⚠️ 文件末尾不足一帧, 已忽略");
        }
        Ok(data
            .chunks_exact(frame_bytes)
            .map(|c| Arc::new(c.to_vec()))
            .collect())
    }

    /// 合成画面: 灰色背景上一个亮块, 按帧在四个象限间移动
    fn synthesize(&self, channel: u32) -> Vec<Arc<Vec<u8>>> {
        let (w, h) = (self.options.width, self.options.height);
        (0..SYNTHETIC_FRAMES)
            .map(|i| {
                let quadrant = (i + channel as usize) % 4;
                let (qx, qy) = ((quadrant % 2) as u32, (quadrant / 2) as u32);
                let img = RgbImage::from_fn(w, h, |x, y| {
                    let inside = x * 2 / w.max(1) == qx && y * 2 / h.max(1) == qy;
                    if inside {
                        Rgb([230, 220, 200])
                    } else {
                        Rgb([40, 40, 40])
                    }
                });
                Arc::new(planar_rgb(&img))
            })
            .collect()
    }

    fn finished(&self) -> bool {
        self.options.max_frames > 0 && self.counters.iter().all(|&c| c >= self.options.max_frames)
    }

    /// 按帧率等待下一帧的时刻
    fn pace(&mut self) {
        if self.options.fps <= 0.0 {
            return;
        }
        let interval = Duration::from_secs_f32(1.0 / (self.options.fps * self.options.channels as f32));
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + interval);
    }

}

impl StageLogic for SourceStage {
    fn prepare(&mut self, ctx: &mut StageContext) -> Result<()> {
        if self.options.channels == 0 {
            return Err(PipelineError::Config("channels 必须大于 0".into()));
        }
        self.frames = match &self.options.input {
            Some(path) => {
                let frames = self.load_raw(path)?;
                tracing::info!(stage = %ctx.name(), path = %path.display(), frames = frames.len(), "📂 raw frames loaded");
                vec![frames; self.options.channels as usize]
            }
            None => (0..self.options.channels).map(|c| self.synthesize(c)).collect(),
        };
        Ok(())
    }

    fn run_loop(&mut self, ctx: &mut StageContext) -> LoopControl {
        if self.finished() {
            tracing::info!(stage = %ctx.name(), frames = ?self.counters, "✅ 所有通道已输出完毕");
            return LoopControl::Finish;
        }
        // 跳过已输出完毕的通道
        let channel = self.next_channel;
        self.next_channel = (self.next_channel + 1) % self.counters.len();
        let frame = self.counters[channel];
        if self.options.max_frames > 0 && frame >= self.options.max_frames {
            return LoopControl::Continue;
        }

        self.pace();
        let Some(slot) = self.pool.acquire_wait(self.options.out_ref, || ctx.is_stopped()) else {
            return LoopControl::Finish;
        };
        let frames = &self.frames[channel];
        let data = frames[frame as usize % frames.len()].clone();
        let tag = Tag::new(channel as u32, frame, 0);
        let Some(buffer) = Buffer::host_surface_pooled(data, self.geometry, tag, self.pool.clone(), slot)
        else {
            tracing::error!(slot, "❌ 帧池下标越界");
            return LoopControl::Finish;
        };

        let Some(mut packet) = ctx.dequeue_output() else {
            buffer.force_release(ctx.cleaner());
            return LoopControl::Finish;
        };
        packet.push(buffer);
        ctx.enqueue_output(packet);
        ctx.stats().step(StatKind::DecodedFrames);
        self.counters[channel] += 1;
        LoopControl::Continue
    }
}
