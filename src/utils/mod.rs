// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 工具函数: 容错加锁与带截止时间的条件变量等待
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// 获取互斥锁, 锁中毒时继续使用内部数据
///
/// 所有受保护的结构都是普通队列/计数表, 持锁线程 panic 后数据依然有效
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 条件变量等待, 可选截止时间
///
/// 返回 `(guard, timed_out)`; 没有截止时间时永不超时
pub fn wait_until<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, T>, bool) {
    match deadline {
        None => (cond.wait(guard).unwrap_or_else(PoisonError::into_inner), false),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            let (guard, result) = cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            (guard, result.timed_out())
        }
    }
}

/// 计数池满时的轮询间隔
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
