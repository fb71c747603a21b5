// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 引用计数: 内部计数 / 外部池化计数
//!
//! 外部计数用于生产者持有的固定资源池 (如加速器表面): Buffer 只保存
//! `(池, 下标)`, 计数单元归池所有, 池中的槽位在计数归零前不可复用。

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::utils::POLL_INTERVAL;

/// 生产者持有的计数池
#[derive(Debug)]
pub struct RefPool {
    cells: Vec<AtomicI32>,
}

impl RefPool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            cells: (0..size).map(|_| AtomicI32::new(0)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// 查找计数 <= 0 的空闲槽位
    pub fn find_free(&self) -> Option<usize> {
        self.cells
            .iter()
            .position(|c| c.load(Ordering::Acquire) <= 0)
    }

    /// 原子地占用一个空闲槽位并设置初始计数
    pub fn acquire(&self, count: i32) -> Option<usize> {
        for (slot, cell) in self.cells.iter().enumerate() {
            let current = cell.load(Ordering::Acquire);
            if current <= 0
                && cell
                    .compare_exchange(current, count, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return Some(slot);
            }
        }
        None
    }

    /// 轮询直到占到空闲槽位; `abort` 返回 true 时放弃
    pub fn acquire_wait(&self, count: i32, abort: impl Fn() -> bool) -> Option<usize> {
        loop {
            if abort() {
                return None;
            }
            if let Some(slot) = self.acquire(count) {
                return Some(slot);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn count(&self, slot: usize) -> Option<i32> {
        self.cells.get(slot).map(|c| c.load(Ordering::Acquire))
    }

    /// 当前仍被占用的槽位数
    pub fn in_use(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| c.load(Ordering::Acquire) > 0)
            .count()
    }
}

/// Buffer 的引用计数
#[derive(Debug)]
pub enum RefCount {
    Internal(AtomicI32),
    External { pool: Arc<RefPool>, slot: usize },
}

impl RefCount {
    /// 内部计数, 默认 1
    pub fn internal() -> Self {
        RefCount::Internal(AtomicI32::new(1))
    }

    /// 外部计数, 下标越界时返回 None
    pub fn external(pool: Arc<RefPool>, slot: usize) -> Option<Self> {
        if slot < pool.len() {
            Some(RefCount::External { pool, slot })
        } else {
            None
        }
    }

    fn cell(&self) -> &AtomicI32 {
        match self {
            RefCount::Internal(cell) => cell,
            // 构造时已校验下标
            RefCount::External { pool, slot } => &pool.cells[*slot],
        }
    }

    pub fn set(&self, count: i32) {
        self.cell().store(count, Ordering::Release);
    }

    pub fn get(&self) -> i32 {
        self.cell().load(Ordering::Acquire)
    }

    /// 计数大于 0 时减一, 返回减之前的值; 已归零时不修改并返回 None
    pub fn decrement(&self) -> Option<i32> {
        self.cell()
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c > 0).then(|| c - 1))
            .ok()
    }

    pub fn is_external(&self) -> bool {
        matches!(self, RefCount::External { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_find_free() {
        let pool = RefPool::new(3);
        assert_eq!(pool.find_free(), Some(0));
        assert_eq!(pool.acquire(2), Some(0));
        assert_eq!(pool.acquire(1), Some(1));
        assert_eq!(pool.find_free(), Some(2));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_pool_exhausted() {
        let pool = RefPool::new(1);
        assert_eq!(pool.acquire(1), Some(0));
        assert_eq!(pool.acquire(1), None);
        assert_eq!(pool.find_free(), None);
    }

    #[test]
    fn test_external_ref_frees_pool_slot() {
        let pool = RefPool::new(2);
        let slot = pool.acquire(2).unwrap();
        let rc = RefCount::external(pool.clone(), slot).unwrap();
        assert!(rc.is_external());
        assert_eq!(rc.decrement(), Some(2));
        assert_eq!(pool.find_free(), Some(1));
        assert_eq!(rc.decrement(), Some(1));
        assert_eq!(pool.find_free(), Some(0));
        // 归零后不再减为负数
        assert_eq!(rc.decrement(), None);
        assert_eq!(pool.count(slot), Some(0));
    }

    #[test]
    fn test_acquire_wait_until_released() {
        let pool = RefPool::new(1);
        let slot = pool.acquire(1).unwrap();
        assert_eq!(pool.acquire_wait(1, || true), None);

        let releaser = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                std::thread::sleep(POLL_INTERVAL * 2);
                pool.cells[slot].store(0, Ordering::Release);
            })
        };
        assert_eq!(pool.acquire_wait(3, || false), Some(slot));
        assert_eq!(pool.count(slot), Some(3));
        releaser.join().unwrap();
    }

    #[test]
    fn test_external_out_of_range() {
        let pool = RefPool::new(1);
        assert!(RefCount::external(pool, 4).is_none());
    }
}
