// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 异步清理队列
//!
//! 计数归零的 Buffer 被放入待清理列表, 由专用后台线程批量取出后销毁,
//! 资源释放 (可能需要与加速器驱动往返) 不占用流水线关键线程。
//! 队列由流水线根对象持有, 通过 [`CleanerHandle`] 分发给各个 Stage。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::Buffer;
use crate::error::Result;
use crate::utils::lock;

/// 后台线程的兜底唤醒周期
const CLEAN_INTERVAL: Duration = Duration::from_millis(100);

struct CleanerShared {
    pending: Mutex<Vec<Buffer>>,
    enqueued: AtomicU64,
    destroyed: AtomicU64,
    release_failures: AtomicU64,
}

/// 清理队列句柄, 可克隆
#[derive(Clone)]
pub struct CleanerHandle {
    shared: Arc<CleanerShared>,
    doorbell: Option<Sender<()>>,
}

impl CleanerHandle {
    /// 没有后台线程的句柄, 需手动 `flush`
    pub fn detached() -> Self {
        Self {
            shared: Arc::new(CleanerShared {
                pending: Mutex::new(Vec::new()),
                enqueued: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                release_failures: AtomicU64::new(0),
            }),
            doorbell: None,
        }
    }

    pub(crate) fn enqueue(&self, buffer: Buffer) {
        tracing::trace!(tag = ?buffer.tag(), kind = buffer.kind().name(), "buffer queued for cleanup");
        lock(&self.shared.pending).push(buffer);
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        if let Some(doorbell) = &self.doorbell {
            // 门铃已满说明清理线程已被唤醒
            let _ = doorbell.try_send(());
        }
    }

    /// 在当前线程立即销毁所有待清理 Buffer, 返回销毁数量
    pub fn flush(&self) -> usize {
        // 先整体取出再释放, 释放期间不阻塞入队
        let pending = std::mem::take(&mut *lock(&self.shared.pending));
        let count = pending.len();
        for buffer in pending {
            if let Err(e) = buffer.release_resources() {
                tracing::warn!(tag = ?buffer.tag(), error = %e, "⚠️ 资源释放失败, Buffer 仍被销毁");
                self.shared.release_failures.fetch_add(1, Ordering::Relaxed);
            }
            self.shared.destroyed.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub fn enqueued_count(&self) -> u64 {
        self.shared.enqueued.load(Ordering::Relaxed)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.shared.destroyed.load(Ordering::Relaxed)
    }

    pub fn release_failures(&self) -> u64 {
        self.shared.release_failures.load(Ordering::Relaxed)
    }
}

/// 清理线程的所有者
pub struct Cleaner {
    handle: CleanerHandle,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Cleaner {
    /// 启动后台清理线程
    pub fn start() -> Result<Self> {
        let (tx, rx) = bounded::<()>(1);
        let mut handle = CleanerHandle::detached();
        handle.doorbell = Some(tx);
        let stop = Arc::new(AtomicBool::new(false));

        let worker_handle = handle.clone();
        let worker_stop = stop.clone();
        let worker = std::thread::Builder::new()
            .name("va-cleaner".to_string())
            .spawn(move || Self::worker_loop(worker_handle, rx, worker_stop))?;

        Ok(Self {
            handle,
            stop,
            worker: Some(worker),
        })
    }

    fn worker_loop(handle: CleanerHandle, doorbell: Receiver<()>, stop: Arc<AtomicBool>) {
        tracing::debug!("cleaner thread started");
        loop {
            match doorbell.recv_timeout(CLEAN_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {
                    handle.flush();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if stop.load(Ordering::Acquire) {
                break;
            }
        }
        let remaining = handle.flush();
        tracing::debug!(remaining, "cleaner thread exited");
    }

    pub fn handle(&self) -> CleanerHandle {
        self.handle.clone()
    }

    /// 停止后台线程并清空剩余 Buffer
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(doorbell) = &self.handle.doorbell {
            let _ = doorbell.try_send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("❌ 清理线程异常退出");
            }
        }
        self.handle.flush();
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
