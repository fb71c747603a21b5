// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 模拟推理后端
//!
//! 槽位在后台线程上执行, 经过固定延迟后产生确定性的输出张量:
//! 每张图像只 "检测" 到最亮的四分之一区域, 类别为该象限编号 + 1。
//! 输出布局与真实模型一致 (SSD `[1,1,N,7]`, YOLO 三尺度 NCHW, 分类 `[B,C]`),
//! 流水线与后处理可以不依赖推理运行时端到端运行。

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use ndarray::{ArrayD, IxDyn};

use super::backend::{
    InputRequirements, ModelBackend, ModelInfo, OutputInfo, OutputTensor, SlotStatus,
};
use crate::buffer::{Buffer, BufferKind, PixelFormat};
use crate::error::{PipelineError, Result};
use crate::models::{ModelKind, YoloConfig};
use crate::utils::{lock, wait_until};

/// YOLO 输出类别数 (COCO)
const YOLO_CLASSES: usize = 80;
/// 分类输出类别数
const CLASSIFY_CLASSES: usize = 1000;
/// 目标框边长 (归一化)
const BOX_SIZE: f32 = 0.4;

/// 模拟后端配置
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub kind: ModelKind,
    pub width: u32,
    pub height: u32,
    pub latency: Duration,
    /// 每执行这么多个批次注入一次失败, 0 表示不注入
    pub fail_every: usize,
}

impl SimulatedConfig {
    pub fn new(kind: ModelKind) -> Self {
        let (width, height) = kind.default_input_size();
        Self {
            kind,
            width,
            height,
            latency: Duration::from_millis(5),
            fail_every: 0,
        }
    }
}

/// 一张图像的摘要: 最亮象限及其平均亮度
#[derive(Debug, Clone, Copy, Default)]
struct Summary {
    quadrant: usize,
    brightness: f32,
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Idle,
    Running,
    Done(Vec<OutputTensor>),
    Failed(String),
}

struct Shared {
    slots: Mutex<Vec<SlotState>>,
    done: Condvar,
}

struct Job {
    slot: usize,
    images: Vec<Summary>,
    submitted: Instant,
    fail: bool,
}

pub struct SimulatedBackend {
    config: SimulatedConfig,
    shared: Arc<Shared>,
    inputs: Vec<Vec<Summary>>,
    batch_size: usize,
    submitted: usize,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                slots: Mutex::new(Vec::new()),
                done: Condvar::new(),
            }),
            inputs: Vec::new(),
            batch_size: 0,
            submitted: 0,
            jobs: None,
            worker: None,
        }
    }

    fn output_infos(&self) -> Vec<OutputInfo> {
        let b = self.batch_size;
        match self.config.kind {
            ModelKind::Ssd => vec![OutputInfo {
                name: "detection_out".into(),
                shape: vec![1, 1, b * 2 + 1, 7],
            }],
            ModelKind::Yolo => {
                let channels = 3 * (4 + 1 + YOLO_CLASSES);
                [32usize, 16, 8]
                    .iter()
                    .map(|stride| OutputInfo {
                        name: format!("yolo_stride{}", stride),
                        shape: vec![
                            b,
                            channels,
                            self.config.height as usize / stride,
                            self.config.width as usize / stride,
                        ],
                    })
                    .collect()
            }
            ModelKind::Resnet => vec![OutputInfo {
                name: "prob".into(),
                shape: vec![b, CLASSIFY_CLASSES],
            }],
        }
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.inputs.len() {
            return Err(PipelineError::Backend(format!("槽位 {} 不存在", slot)));
        }
        Ok(())
    }
}

impl ModelBackend for SimulatedBackend {
    fn load(&mut self, batch_size: usize, depth: usize) -> Result<ModelInfo> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(PipelineError::ModelLoad("输入尺寸为 0".into()));
        }
        self.batch_size = batch_size;
        self.inputs = vec![Vec::with_capacity(batch_size); depth];
        *lock(&self.shared.slots) = (0..depth).map(|_| SlotState::Idle).collect();

        let (tx, rx) = unbounded::<Job>();
        let shared = self.shared.clone();
        let config = self.config.clone();
        let infos = self.output_infos();
        let worker = std::thread::Builder::new()
            .name("va-sim-backend".into())
            .spawn(move || {
                // 发送端关闭时退出
                for job in rx.iter() {
                    let ready_at = job.submitted + config.latency;
                    if let Some(remaining) = ready_at.checked_duration_since(Instant::now()) {
                        std::thread::sleep(remaining);
                    }
                    let state = if job.fail {
                        SlotState::Failed("simulated device error".into())
                    } else {
                        SlotState::Done(render(&config, &infos, &job.images))
                    };
                    let mut slots = lock(&shared.slots);
                    if let Some(s) = slots.get_mut(job.slot) {
                        *s = state;
                    }
                    shared.done.notify_all();
                }
            })?;
        self.jobs = Some(tx);
        self.worker = Some(worker);

        Ok(ModelInfo {
            batch_size,
            input: self.requirements(),
            outputs: self.output_infos(),
        })
    }

    fn requirements(&self) -> InputRequirements {
        InputRequirements::new(self.config.width, self.config.height, PixelFormat::Rgbp)
    }

    fn fill_input(&mut self, slot: usize, index: usize, image: &Buffer) -> Result<()> {
        self.check_slot(slot)?;
        if index >= self.batch_size {
            return Err(PipelineError::Backend(format!(
                "批内下标 {} 超出 batch {}",
                index, self.batch_size
            )));
        }
        let summary = summarize(image);
        let inputs = &mut self.inputs[slot];
        inputs.truncate(index);
        inputs.push(summary);
        Ok(())
    }

    fn submit(&mut self, slot: usize, count: usize) -> Result<()> {
        self.check_slot(slot)?;
        let Some(jobs) = &self.jobs else {
            return Err(PipelineError::Backend("模型未加载".into()));
        };
        let mut images = std::mem::take(&mut self.inputs[slot]);
        images.truncate(count);
        self.submitted += 1;
        let fail = self.config.fail_every > 0 && self.submitted % self.config.fail_every == 0;

        lock(&self.shared.slots)[slot] = SlotState::Running;
        jobs.send(Job {
            slot,
            images,
            submitted: Instant::now(),
            fail,
        })
        .map_err(|_| PipelineError::Backend("执行线程已退出".into()))
    }

    fn poll(&mut self, slot: usize) -> SlotStatus {
        let slots = lock(&self.shared.slots);
        status_of(slots.get(slot))
    }

    fn wait(&mut self, slot: usize, timeout: Duration) -> SlotStatus {
        let deadline = Instant::now() + timeout;
        let mut slots = lock(&self.shared.slots);
        loop {
            let status = status_of(slots.get(slot));
            if status != SlotStatus::Pending {
                return status;
            }
            let (guard, timed_out) = wait_until(&self.shared.done, slots, Some(deadline));
            slots = guard;
            if timed_out {
                return status_of(slots.get(slot));
            }
        }
    }

    fn outputs(&mut self, slot: usize) -> Result<Vec<OutputTensor>> {
        let mut slots = lock(&self.shared.slots);
        match slots.get_mut(slot).map(std::mem::take) {
            Some(SlotState::Done(tensors)) => Ok(tensors),
            Some(other) => {
                let msg = format!("槽位 {} 状态 {:?}, 没有输出", slot, other);
                slots[slot] = other;
                Err(PipelineError::Backend(msg))
            }
            None => Err(PipelineError::Backend(format!("槽位 {} 不存在", slot))),
        }
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn status_of(state: Option<&SlotState>) -> SlotStatus {
    match state {
        Some(SlotState::Done(_)) => SlotStatus::Ready,
        Some(SlotState::Failed(reason)) => SlotStatus::Failed(reason.clone()),
        Some(SlotState::Running) => SlotStatus::Pending,
        // 空闲槽位或已被读取
        Some(SlotState::Idle) | None => SlotStatus::Ready,
    }
}

/// 计算最亮象限; 非主机表面按象限 0 处理
fn summarize(image: &Buffer) -> Summary {
    let BufferKind::HostSurface(surface) = image.kind() else {
        return Summary::default();
    };
    let g = surface.geometry;
    let (w, h, pitch) = (g.width as usize, g.height as usize, g.pitch as usize);
    if w < 2 || h < 2 {
        return Summary::default();
    }
    let plane = pitch * h;
    let planes = match g.format {
        PixelFormat::Rgbp => 3,
        _ => 1,
    };
    let mut sums = [0u64; 4];
    for p in 0..planes {
        for y in 0..h {
            let Some(row) = surface.data.get(p * plane + y * pitch..p * plane + y * pitch + w)
            else {
                continue;
            };
            for (x, &v) in row.iter().enumerate() {
                let q = (y * 2 / h) * 2 + x * 2 / w;
                sums[q] += v as u64;
            }
        }
    }
    let per_quadrant = (w * h * planes / 4).max(1) as f32;
    let (quadrant, best) = sums
        .iter()
        .enumerate()
        .max_by_key(|(_, s)| **s)
        .map(|(q, s)| (q, *s))
        .unwrap_or((0, 0));
    Summary {
        quadrant,
        brightness: best as f32 / per_quadrant / 255.0,
    }
}

/// 象限中心 (归一化)
fn quadrant_center(q: usize) -> (f32, f32) {
    (0.25 + 0.5 * (q % 2) as f32, 0.25 + 0.5 * (q / 2) as f32)
}

fn render(config: &SimulatedConfig, infos: &[OutputInfo], images: &[Summary]) -> Vec<OutputTensor> {
    match config.kind {
        ModelKind::Ssd => vec![render_ssd(&infos[0], images)],
        ModelKind::Yolo => render_yolo(config, infos, images),
        ModelKind::Resnet => vec![render_classes(&infos[0], images)],
    }
}

/// 每张图像一个高置信度框和一个低置信度框, 末尾用 imgid = -1 结束
fn render_ssd(info: &OutputInfo, images: &[Summary]) -> OutputTensor {
    let rows = info.shape[2];
    let mut data = vec![0.0f32; rows * 7];
    let mut r = 0;
    for (b, s) in images.iter().enumerate() {
        let (cx, cy) = quadrant_center(s.quadrant);
        let half = BOX_SIZE / 2.0;
        let label = (s.quadrant + 1) as f32;
        let strong = [b as f32, label, 0.9, cx - half, cy - half, cx + half, cy + half];
        let weak = [b as f32, label, 0.3, cx - 0.1, cy - 0.1, cx + 0.1, cy + 0.1];
        for row in [strong, weak] {
            if r < rows {
                data[r * 7..r * 7 + 7].copy_from_slice(&row);
                r += 1;
            }
        }
    }
    if r < rows {
        data[r * 7] = -1.0;
    }
    OutputTensor::new(
        &info.name,
        ArrayD::from_shape_vec(IxDyn(&info.shape), data).unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0]))),
    )
}

/// 只在最粗尺度点亮象限中心所在的格子 (anchor 0)
fn render_yolo(config: &SimulatedConfig, infos: &[OutputInfo], images: &[Summary]) -> Vec<OutputTensor> {
    let anchors = YoloConfig::default().anchors;
    // 最粗尺度使用最后一组 mask
    let (anchor_w, anchor_h) = (anchors[12], anchors[13]);
    let coarsest = infos.iter().map(|i| i.shape[2]).min().unwrap_or(0);

    infos
        .iter()
        .map(|info| {
            let (side_h, side_w) = (info.shape[2], info.shape[3]);
            let cells = side_h * side_w;
            let per_image = info.shape[1] * cells;
            let mut data = vec![-20.0f32; info.shape[0] * per_image];
            if side_h == coarsest {
                for (b, s) in images.iter().enumerate() {
                    let (cx, cy) = quadrant_center(s.quadrant);
                    let col = ((cx * side_w as f32) as usize).min(side_w - 1);
                    let row = ((cy * side_h as f32) as usize).min(side_h - 1);
                    let loc = row * side_w + col;
                    let base = b * per_image;
                    let at = |entry: usize| base + entry * cells + loc;
                    data[at(0)] = 0.0;
                    data[at(1)] = 0.0;
                    data[at(2)] = (BOX_SIZE * config.width as f32 / anchor_w).ln();
                    data[at(3)] = (BOX_SIZE * config.height as f32 / anchor_h).ln();
                    data[at(4)] = 8.0;
                    data[at(5 + s.quadrant % YOLO_CLASSES)] = 8.0;
                }
            }
            OutputTensor::new(
                &info.name,
                ArrayD::from_shape_vec(IxDyn(&info.shape), data)
                    .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0]))),
            )
        })
        .collect()
}

/// 类别 = 象限编号, 分数随亮度变化
fn render_classes(info: &OutputInfo, images: &[Summary]) -> OutputTensor {
    let classes = info.shape[1];
    let mut data = vec![0.0f32; info.shape[0] * classes];
    for (b, s) in images.iter().enumerate() {
        data[b * classes + s.quadrant % classes] = 0.5 + 0.5 * s.brightness.clamp(0.0, 1.0);
    }
    OutputTensor::new(
        &info.name,
        ArrayD::from_shape_vec(IxDyn(&info.shape), data).unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0]))),
    )
}
