// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! Connector / Pin: Stage 之间的有界线程安全交接点
//!
//! 每个 Connector 持有固定数量的 Packet 池。生产者通过 *输入 Pin*
//! `get()` 取出空闲 Packet、填充后 `store()`; 消费者通过 *输出 Pin*
//! `get()` 取出已填充的 Packet、清空后 `store()` 归还。
//!
//! 两种分发策略:
//! - [`DispatchPolicy::Fifo`]: 单一已填充队列, 保持全局顺序
//! - [`DispatchPolicy::Sharded`]: 按 `channel % 输出数` 路由到各输出分片,
//!   同一通道的 Packet 只被一个消费者按到达顺序看到

mod fifo;
mod sharded;
pub mod sink;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::buffer::CleanerHandle;
use crate::packet::Packet;
use crate::utils::{lock, wait_until};

pub use sink::{CsvWriterPin, SinkPin};

/// Pin 通用接口
///
/// `get` 返回 None 表示 Pin 已断开或对端已全部关闭, Stage 应退出循环。
pub trait Pin: Send + Sync {
    /// 阻塞获取
    fn get(&self) -> Option<Packet>;
    /// 带超时获取, 超时返回 None
    fn get_timeout(&self, timeout: Duration) -> Option<Packet>;
    fn store(&self, packet: Packet);
    /// 从 Connector 的活动集合中移除, 唤醒所有等待者
    fn disconnect(&self);
    /// 不会再有 Packet 可取
    fn is_closed(&self) -> bool;
}

/// 分发策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DispatchPolicy {
    Fifo,
    Sharded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    /// 生产者侧
    Input,
    /// 消费者侧
    Output,
}

// ========== Packet 队列 ==========

/// 带条件变量的 Packet 队列, 一把锁保护一个逻辑队列
pub(crate) struct PacketQueue {
    items: Mutex<VecDeque<Packet>>,
    ready: Condvar,
    // 消费者已离开, 不再接收 Packet (持 items 锁读写)
    closed: AtomicBool,
}

impl PacketQueue {
    pub(crate) fn new() -> Self {
        Self::filled(std::iter::empty())
    }

    pub(crate) fn filled(packets: impl IntoIterator<Item = Packet>) -> Self {
        Self {
            items: Mutex::new(packets.into_iter().collect()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// 队列已关闭时原样退回 Packet
    pub(crate) fn push_back_open(&self, packet: Packet) -> std::result::Result<(), Packet> {
        let mut items = lock(&self.items);
        if self.closed.load(Ordering::Acquire) {
            return Err(packet);
        }
        items.push_back(packet);
        drop(items);
        self.ready.notify_one();
        Ok(())
    }

    /// 关闭队列并取出剩余的 Packet
    pub(crate) fn close(&self) -> Vec<Packet> {
        let mut items = lock(&self.items);
        self.closed.store(true, Ordering::Release);
        let rest = items.drain(..).collect();
        drop(items);
        self.ready.notify_all();
        rest
    }

    pub(crate) fn push_back(&self, packet: Packet) {
        lock(&self.items).push_back(packet);
        self.ready.notify_one();
    }

    pub(crate) fn push_front(&self, packet: Packet) {
        lock(&self.items).push_front(packet);
        self.ready.notify_one();
    }

    /// 弹出队首; 队列为空时等待。
    /// `abort(has_items)` 在持锁状态下检查, 返回 true 时放弃等待。
    pub(crate) fn pop_wait(
        &self,
        deadline: Option<Instant>,
        abort: impl Fn(bool) -> bool,
    ) -> Option<Packet> {
        let mut items = lock(&self.items);
        loop {
            if abort(!items.is_empty()) {
                return None;
            }
            if let Some(packet) = items.pop_front() {
                return Some(packet);
            }
            let (guard, timed_out) = wait_until(&self.ready, items, deadline);
            items = guard;
            if timed_out {
                return if abort(!items.is_empty()) {
                    None
                } else {
                    items.pop_front()
                };
            }
        }
    }

    /// 持锁后唤醒全部等待者, 避免丢失唤醒
    pub(crate) fn wake_all(&self) {
        let _guard = lock(&self.items);
        self.ready.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.items).len()
    }
}

// ========== Connector ==========

enum Queues {
    Fifo(fifo::FifoQueues),
    Sharded(sharded::ShardedQueues),
}

#[derive(Default)]
struct PinRegistry {
    issued_inputs: usize,
    issued_outputs: usize,
    active_inputs: Vec<usize>,
    active_outputs: Vec<usize>,
    // 断开的 Pin 保留下标, 不复用
    disconnected_inputs: Vec<usize>,
    disconnected_outputs: Vec<usize>,
}

struct ConnectorShared {
    id: u64,
    name: String,
    policy: DispatchPolicy,
    max_inputs: usize,
    max_outputs: usize,
    pool_size: usize,
    queues: Queues,
    registry: Mutex<PinRegistry>,
    no_input: AtomicBool,
    no_output: AtomicBool,
    // 丢弃 Packet 中的 Buffer 交给它释放
    cleaner: Mutex<CleanerHandle>,
}

static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// 有界交接点
#[derive(Clone)]
pub struct Connector {
    shared: Arc<ConnectorShared>,
}

impl Connector {
    /// 创建 Connector
    ///
    /// FIFO 策略的池大小为 `max_inputs * buffer_num`,
    /// 分片策略为 `max_outputs * buffer_num`。
    pub fn new(
        name: &str,
        policy: DispatchPolicy,
        max_inputs: usize,
        max_outputs: usize,
        buffer_num: usize,
    ) -> Self {
        let id = NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed);
        let max_inputs = max_inputs.max(1);
        let max_outputs = max_outputs.max(1);
        let (pool_size, queues) = match policy {
            DispatchPolicy::Fifo => {
                let size = max_inputs * buffer_num.max(1);
                (size, Queues::Fifo(fifo::FifoQueues::new(id, size)))
            }
            DispatchPolicy::Sharded => {
                let size = max_outputs * buffer_num.max(1);
                (
                    size,
                    Queues::Sharded(sharded::ShardedQueues::new(id, size, max_outputs)),
                )
            }
        };
        tracing::debug!(name, ?policy, pool_size, max_inputs, max_outputs, "connector created");
        Self {
            shared: Arc::new(ConnectorShared {
                id,
                name: name.to_string(),
                policy,
                max_inputs,
                max_outputs,
                pool_size,
                queues,
                registry: Mutex::new(PinRegistry::default()),
                no_input: AtomicBool::new(false),
                no_output: AtomicBool::new(false),
                cleaner: Mutex::new(CleanerHandle::detached()),
            }),
        }
    }

    pub fn fifo(name: &str, max_inputs: usize, max_outputs: usize, buffer_num: usize) -> Self {
        Self::new(name, DispatchPolicy::Fifo, max_inputs, max_outputs, buffer_num)
    }

    pub fn sharded(name: &str, max_inputs: usize, max_outputs: usize, buffer_num: usize) -> Self {
        Self::new(name, DispatchPolicy::Sharded, max_inputs, max_outputs, buffer_num)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 被丢弃的 Packet 中的 Buffer 交给该清理队列
    pub fn set_cleaner(&self, cleaner: CleanerHandle) {
        *lock(&self.shared.cleaner) = cleaner;
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.shared.policy
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }

    /// 生产者侧 Pin, 超过最大数量时返回 None
    pub fn new_input_pin(&self) -> Option<Arc<ConnectorPin>> {
        self.new_pin(PinDirection::Input)
    }

    /// 消费者侧 Pin, 超过最大数量时返回 None
    pub fn new_output_pin(&self) -> Option<Arc<ConnectorPin>> {
        self.new_pin(PinDirection::Output)
    }

    fn new_pin(&self, direction: PinDirection) -> Option<Arc<ConnectorPin>> {
        let s = &self.shared;
        let mut reg = lock(&s.registry);
        let reg = &mut *reg;
        let (issued, active, max) = match direction {
            PinDirection::Input => (&mut reg.issued_inputs, &mut reg.active_inputs, s.max_inputs),
            PinDirection::Output => (
                &mut reg.issued_outputs,
                &mut reg.active_outputs,
                s.max_outputs,
            ),
        };
        if *issued >= max {
            tracing::warn!(connector = %s.name, ?direction, max, "no free pin");
            return None;
        }
        let index = *issued;
        *issued += 1;
        active.push(index);
        Some(Arc::new(ConnectorPin {
            connector: self.clone(),
            direction,
            index,
            disconnected: AtomicBool::new(false),
        }))
    }

    /// 当前空闲 Packet 数
    pub fn free_packets(&self) -> usize {
        match &self.shared.queues {
            Queues::Fifo(q) => q.free_len(),
            Queues::Sharded(q) => q.free_len(),
        }
    }

    /// 已填充待取的 Packet 数
    pub fn queued_packets(&self) -> usize {
        match &self.shared.queues {
            Queues::Fifo(q) => q.filled_len(),
            Queues::Sharded(q) => q.filled_len(),
        }
    }

    pub fn active_pins(&self) -> (usize, usize) {
        let reg = lock(&self.shared.registry);
        (reg.active_inputs.len(), reg.active_outputs.len())
    }

    pub fn disconnected_pins(&self) -> (usize, usize) {
        let reg = lock(&self.shared.registry);
        (reg.disconnected_inputs.len(), reg.disconnected_outputs.len())
    }

    fn disconnect_pin(&self, direction: PinDirection, index: usize) {
        let s = &self.shared;
        {
            let mut reg = lock(&s.registry);
            let reg = &mut *reg;
            let (active, side, flag) = match direction {
                PinDirection::Input => (
                    &mut reg.active_inputs,
                    &mut reg.disconnected_inputs,
                    &s.no_input,
                ),
                PinDirection::Output => (
                    &mut reg.active_outputs,
                    &mut reg.disconnected_outputs,
                    &s.no_output,
                ),
            };
            let Some(pos) = active.iter().position(|&i| i == index) else {
                return;
            };
            active.remove(pos);
            side.push(index);
            if active.is_empty() {
                flag.store(true, Ordering::Release);
            }
        }
        tracing::debug!(connector = %s.name, ?direction, index, "pin disconnected");
        // 分片的消费者已离开: 丢弃积压的 Packet, 之后路由到该分片的也直接丢弃
        if let (PinDirection::Output, Queues::Sharded(q)) = (direction, &s.queues) {
            let rest = q.close_shard(index);
            if !rest.is_empty() {
                tracing::warn!(connector = %s.name, shard = index, count = rest.len(), "⚠️ 分片消费者已断开, 丢弃积压的 Packet");
            }
            for packet in rest {
                self.discard(packet);
            }
        }
        self.wake_all();
    }

    /// 释放 Packet 中的全部 Buffer 并把空 Packet 还回空闲表
    fn discard(&self, mut packet: Packet) {
        let cleaner = lock(&self.shared.cleaner).clone();
        for buffer in packet.drain() {
            buffer.force_release(&cleaner);
        }
        self.recycle(packet);
    }

    fn recycle(&self, packet: Packet) {
        match &self.shared.queues {
            Queues::Fifo(q) => q.recycle(packet),
            Queues::Sharded(q) => q.recycle(packet),
        }
    }

    fn wake_all(&self) {
        match &self.shared.queues {
            Queues::Fifo(q) => q.wake_all(),
            Queues::Sharded(q) => q.wake_all(),
        }
    }

    fn no_input(&self) -> bool {
        self.shared.no_input.load(Ordering::Acquire)
    }

    fn no_output(&self) -> bool {
        self.shared.no_output.load(Ordering::Acquire)
    }
}

// ========== ConnectorPin ==========

/// 绑定到某个 Connector 的方向 + 下标
pub struct ConnectorPin {
    connector: Connector,
    direction: PinDirection,
    index: usize,
    disconnected: AtomicBool,
}

impl ConnectorPin {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn direction(&self) -> PinDirection {
        self.direction
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn fetch(&self, deadline: Option<Instant>) -> Option<Packet> {
        let c = &self.connector;
        match self.direction {
            // 生产者取空闲 Packet: 无消费者时放弃
            PinDirection::Input => {
                let abort = |_has: bool| self.is_disconnected() || c.no_output();
                match &c.shared.queues {
                    Queues::Fifo(q) => q.take_free(deadline, abort),
                    Queues::Sharded(q) => q.take_free(deadline, abort),
                }
            }
            // 消费者取已填充 Packet: 生产者全部断开后先取完剩余再返回 None
            PinDirection::Output => {
                let abort = |has: bool| self.is_disconnected() || (!has && c.no_input());
                match &c.shared.queues {
                    Queues::Fifo(q) => q.take_filled(deadline, abort),
                    Queues::Sharded(q) => q.take_filled(self.index, deadline, abort),
                }
            }
        }
    }
}

impl Pin for ConnectorPin {
    fn get(&self) -> Option<Packet> {
        self.fetch(None)
    }

    fn get_timeout(&self, timeout: Duration) -> Option<Packet> {
        self.fetch(Some(Instant::now() + timeout))
    }

    fn store(&self, packet: Packet) {
        let c = &self.connector;
        if packet.owner() != c.shared.id {
            tracing::warn!(
                connector = %c.shared.name,
                owner = packet.owner(),
                "⚠️ 外来 Packet 被存入, 已忽略"
            );
            return;
        }
        if self.is_disconnected() {
            tracing::warn!(
                connector = %c.shared.name,
                direction = ?self.direction,
                index = self.index,
                "⚠️ Pin 已断开, 存入的 Packet 被丢弃"
            );
            c.discard(packet);
            return;
        }
        match self.direction {
            PinDirection::Input => {
                tracing::trace!(connector = %c.shared.name, len = packet.len(), "packet stored");
                let rejected = match &c.shared.queues {
                    Queues::Fifo(q) => {
                        q.store_filled(packet);
                        None
                    }
                    Queues::Sharded(q) => q.store_filled(packet).err(),
                };
                if let Some(packet) = rejected {
                    tracing::trace!(connector = %c.shared.name, "shard closed, packet dropped");
                    c.discard(packet);
                }
            }
            PinDirection::Output => {
                if !packet.is_empty() {
                    tracing::warn!(
                        connector = %c.shared.name,
                        len = packet.len(),
                        "⚠️ 归还的 Packet 未清空, 释放其中的 Buffer"
                    );
                }
                c.discard(packet);
            }
        }
    }

    fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            self.connector.disconnect_pin(self.direction, self.index);
        }
    }

    fn is_closed(&self) -> bool {
        if self.is_disconnected() {
            return true;
        }
        let c = &self.connector;
        match self.direction {
            PinDirection::Input => c.no_output(),
            PinDirection::Output => {
                c.no_input()
                    && match &c.shared.queues {
                        Queues::Fifo(q) => q.filled_len() == 0,
                        Queues::Sharded(q) => q.shard_len(self.index) == 0,
                    }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, Tag};
    use std::thread;

    fn fill(packet: &mut Packet, channel: u32, frame: u32) {
        packet.push(Buffer::classification(0, 0.5, Tag::new(channel, frame, 0)));
    }

    #[test]
    fn test_pin_limit() {
        let c = Connector::fifo("c", 1, 2, 2);
        assert!(c.new_input_pin().is_some());
        assert!(c.new_input_pin().is_none());
        let a = c.new_output_pin().unwrap();
        let b = c.new_output_pin().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert!(c.new_output_pin().is_none());
    }

    #[test]
    fn test_disconnected_index_not_reused() {
        let c = Connector::fifo("c", 1, 2, 2);
        let a = c.new_output_pin().unwrap();
        a.disconnect();
        let b = c.new_output_pin().unwrap();
        assert_eq!(b.index(), 1);
        assert!(c.new_output_pin().is_none());
        assert_eq!(c.disconnected_pins(), (0, 1));
        assert_eq!(c.active_pins(), (0, 1));
    }

    #[test]
    fn test_pool_bounded() {
        let c = Connector::fifo("c", 2, 1, 3);
        let input = c.new_input_pin().unwrap();
        let _output = c.new_output_pin().unwrap();
        assert_eq!(c.pool_size(), 6);
        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(input.get_timeout(Duration::from_millis(10)).unwrap());
        }
        assert!(input.get_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(c.free_packets(), 0);
    }

    #[test]
    fn test_foreign_packet_ignored() {
        let c = Connector::fifo("c", 1, 1, 1);
        let input = c.new_input_pin().unwrap();
        let output = c.new_output_pin().unwrap();
        let mut foreign = Packet::new();
        fill(&mut foreign, 0, 0);
        input.store(foreign);
        assert_eq!(c.queued_packets(), 0);
        assert!(output.get_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_disconnect_wakes_blocked_consumer() {
        let c = Connector::fifo("c", 1, 1, 2);
        let input = c.new_input_pin().unwrap();
        let output = c.new_output_pin().unwrap();
        let waiter = {
            let output = output.clone();
            thread::spawn(move || output.get())
        };
        thread::sleep(Duration::from_millis(20));
        input.disconnect();
        assert!(waiter.join().unwrap().is_none());
        assert!(output.is_closed());
    }

    #[test]
    fn test_consumer_drains_after_producer_closes() {
        let c = Connector::fifo("c", 1, 1, 2);
        let input = c.new_input_pin().unwrap();
        let output = c.new_output_pin().unwrap();
        let mut p = input.get().unwrap();
        fill(&mut p, 0, 1);
        input.store(p);
        input.disconnect();
        assert!(!output.is_closed());
        let mut got = output.get().unwrap();
        assert_eq!(got.frame_id().unwrap().frame, 1);
        got.clear();
        output.store(got);
        assert!(output.get().is_none());
    }

    #[test]
    fn test_producer_aborts_without_consumers() {
        let c = Connector::fifo("c", 1, 1, 1);
        let input = c.new_input_pin().unwrap();
        let output = c.new_output_pin().unwrap();
        let _held = input.get().unwrap();
        let waiter = {
            let input = input.clone();
            thread::spawn(move || input.get())
        };
        thread::sleep(Duration::from_millis(20));
        output.disconnect();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_returned_packet_contents_released() {
        use crate::buffer::{CleanerHandle, Geometry, PixelFormat, RefPool};

        let c = Connector::fifo("c", 1, 1, 1);
        let cleaner = CleanerHandle::detached();
        c.set_cleaner(cleaner.clone());
        let input = c.new_input_pin().unwrap();
        let output = c.new_output_pin().unwrap();

        let pool = RefPool::new(1);
        let slot = pool.acquire(1).unwrap();
        let g = Geometry::packed(4, 4, PixelFormat::Rgbp);
        let frame = Buffer::host_surface_pooled(
            std::sync::Arc::new(vec![0; g.frame_bytes()]),
            g,
            Tag::new(0, 3, 0),
            pool.clone(),
            slot,
        )
        .unwrap();
        let mut p = input.get().unwrap();
        p.push(frame);
        input.store(p);

        // 消费者没有清空就归还
        let got = output.get().unwrap();
        assert_eq!(pool.in_use(), 1);
        output.store(got);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(cleaner.pending_len(), 1);
        let reused = input.get_timeout(Duration::from_millis(10)).unwrap();
        assert!(reused.is_empty());
    }
}
