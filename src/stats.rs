// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 运行统计: 解码帧数、推理收发帧数
//!
//! 计数器在周期内累加, `update()` 结束一个周期并累计到总数,
//! `report()` 输出当前周期与平均帧率。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

/// 统计项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatKind {
    DecodedFrames,
    InferenceFramesReceived,
    InferenceFramesProcessed,
    /// 目标检测输入帧
    DetectionsReceived,
    /// 目标检测完成帧
    DetectionsProcessed,
    /// 分类输入 ROI
    ClassificationsReceived,
    /// 分类完成 ROI
    ClassificationsProcessed,
}

impl StatKind {
    pub const ALL: [StatKind; 7] = [
        StatKind::DecodedFrames,
        StatKind::InferenceFramesReceived,
        StatKind::InferenceFramesProcessed,
        StatKind::DetectionsReceived,
        StatKind::DetectionsProcessed,
        StatKind::ClassificationsReceived,
        StatKind::ClassificationsProcessed,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

const KINDS: usize = StatKind::ALL.len();

#[derive(Default)]
struct Counter {
    current: AtomicU64,
    last_cycle: AtomicU64,
    accumulated: AtomicU64,
}

/// 统计快照 (JSON 输出)
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: String,
    pub cycles: u64,
    pub decoded_fps: u64,
    pub decoded_avg_fps: u64,
    pub inference_fps: u64,
    pub inference_avg_fps: u64,
    pub decoded_total: u64,
    pub detections_received: u64,
    pub detections_processed: u64,
    pub classifications_received: u64,
    pub classifications_processed: u64,
}

/// 进程内统计计数器
pub struct Statistics {
    counters: [Counter; KINDS],
    cycles: AtomicU64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            counters: Default::default(),
            cycles: AtomicU64::new(0),
        }
    }
}

impl Statistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn step(&self, kind: StatKind) {
        self.add(kind, 1);
    }

    pub fn add(&self, kind: StatKind, n: u64) {
        self.counters[kind.index()]
            .current
            .fetch_add(n, Ordering::Relaxed);
    }

    /// 累计总数 (含当前周期)
    pub fn total(&self, kind: StatKind) -> u64 {
        let c = &self.counters[kind.index()];
        c.accumulated.load(Ordering::Relaxed) + c.current.load(Ordering::Relaxed)
    }

    /// 结束当前周期
    pub fn update(&self) {
        for c in &self.counters {
            let value = c.current.swap(0, Ordering::Relaxed);
            c.last_cycle.store(value, Ordering::Relaxed);
            c.accumulated.fetch_add(value, Ordering::Relaxed);
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// 解码与各推理阶段都至少处理过一帧
    pub fn is_started(&self) -> bool {
        let decoded = self.total(StatKind::DecodedFrames) > 0;
        let od = self.total(StatKind::DetectionsReceived) == 0
            || self.total(StatKind::DetectionsProcessed) > 0;
        let oc = self.total(StatKind::ClassificationsReceived) == 0
            || self.total(StatKind::ClassificationsProcessed) > 0;
        decoded && od && oc
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let cycles = self.cycles.load(Ordering::Relaxed);
        let last = |k: StatKind| self.counters[k.index()].last_cycle.load(Ordering::Relaxed);
        let acc = |k: StatKind| self.counters[k.index()].accumulated.load(Ordering::Relaxed);
        let avg = |k: StatKind| acc(k).checked_div(cycles).unwrap_or(0);
        StatsSnapshot {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            cycles,
            decoded_fps: last(StatKind::DecodedFrames),
            decoded_avg_fps: avg(StatKind::DecodedFrames),
            inference_fps: last(StatKind::InferenceFramesProcessed),
            inference_avg_fps: avg(StatKind::InferenceFramesProcessed),
            decoded_total: acc(StatKind::DecodedFrames),
            detections_received: acc(StatKind::DetectionsReceived),
            detections_processed: acc(StatKind::DetectionsProcessed),
            classifications_received: acc(StatKind::ClassificationsReceived),
            classifications_processed: acc(StatKind::ClassificationsProcessed),
        }
    }

    pub fn report(&self) {
        let s = self.snapshot();
        tracing::info!(
            cycle = s.cycles,
            decode_fps = s.decoded_fps,
            decode_avg = s.decoded_avg_fps,
            infer_fps = s.inference_fps,
            infer_avg = s.inference_avg_fps,
            decoded = s.decoded_total,
            od_in = s.detections_received,
            od_out = s.detections_processed,
            oc_in = s.classifications_received,
            oc_out = s.classifications_processed,
            "📊 stats"
        );
    }

    /// 启动周期报告线程, `stop` 置位后退出
    pub fn report_periodically(
        self: &Arc<Self>,
        period: Duration,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let stats = self.clone();
        let handle = std::thread::Builder::new()
            .name("va-stats".to_string())
            .spawn(move || {
                let tick = Duration::from_millis(20).min(period);
                let mut elapsed = Duration::ZERO;
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    elapsed += tick;
                    if elapsed >= period {
                        elapsed = Duration::ZERO;
                        stats.update();
                        stats.report();
                    }
                }
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_rolls_cycle() {
        let stats = Statistics::new();
        for _ in 0..30 {
            stats.step(StatKind::DecodedFrames);
        }
        stats.update();
        stats.add(StatKind::DecodedFrames, 10);
        stats.update();
        let s = stats.snapshot();
        assert_eq!(s.cycles, 2);
        assert_eq!(s.decoded_fps, 10);
        assert_eq!(s.decoded_avg_fps, 20);
        assert_eq!(s.decoded_total, 40);
    }

    #[test]
    fn test_is_started() {
        let stats = Statistics::new();
        assert!(!stats.is_started());
        stats.step(StatKind::DecodedFrames);
        stats.step(StatKind::DetectionsReceived);
        assert!(!stats.is_started());
        stats.step(StatKind::DetectionsProcessed);
        assert!(stats.is_started());
    }

    #[test]
    fn test_snapshot_json() {
        let stats = Statistics::new();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"decoded_total\":0"));
    }

    #[test]
    fn test_periodic_reporter_stops() {
        let stats = Statistics::new();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = stats
            .report_periodically(Duration::from_millis(10), stop.clone())
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        stop.store(true, Ordering::Release);
        handle.join().unwrap();
        assert!(stats.snapshot().cycles >= 1);
    }
}
