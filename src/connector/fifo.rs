// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 严格 FIFO 策略: 一个空闲表供所有输入, 一个已填充队列供所有输出
//!
//! 输入侧与输出侧各用一把锁, 生产者与消费者互不争用。

use std::time::Instant;

use super::PacketQueue;
use crate::packet::Packet;

pub(crate) struct FifoQueues {
    free: PacketQueue,
    filled: PacketQueue,
}

impl FifoQueues {
    pub(crate) fn new(owner: u64, pool_size: usize) -> Self {
        Self {
            free: PacketQueue::filled((0..pool_size).map(|_| Packet::with_owner(owner))),
            filled: PacketQueue::new(),
        }
    }

    pub(crate) fn take_free(
        &self,
        deadline: Option<Instant>,
        abort: impl Fn(bool) -> bool,
    ) -> Option<Packet> {
        self.free.pop_wait(deadline, abort)
    }

    pub(crate) fn store_filled(&self, packet: Packet) {
        self.filled.push_back(packet);
    }

    pub(crate) fn take_filled(
        &self,
        deadline: Option<Instant>,
        abort: impl Fn(bool) -> bool,
    ) -> Option<Packet> {
        self.filled.pop_wait(deadline, abort)
    }

    /// 归还的 Packet 放到空闲表头部, 优先复用
    pub(crate) fn recycle(&self, packet: Packet) {
        self.free.push_front(packet);
    }

    pub(crate) fn wake_all(&self) {
        self.free.wake_all();
        self.filled.wake_all();
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn filled_len(&self) -> usize {
        self.filled.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::{Buffer, CleanerHandle, Geometry, PixelFormat, RefPool, Tag};
    use crate::connector::{Connector, Pin};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pooled(pool: &Arc<RefPool>, count: i32) -> Buffer {
        let slot = pool.acquire(count).unwrap();
        let g = Geometry::packed(4, 4, PixelFormat::Rgbp);
        Buffer::host_surface_pooled(Arc::new(vec![0; g.frame_bytes()]), g, Tag::new(0, 0, 0), pool.clone(), slot)
            .unwrap()
    }

    #[test]
    fn test_total_order_across_channels() {
        let c = Connector::fifo("fifo", 2, 1, 4);
        let a = c.new_input_pin().unwrap();
        let b = c.new_input_pin().unwrap();
        let out = c.new_output_pin().unwrap();
        let mut expected = Vec::new();
        for frame in 0..4u32 {
            for (channel, pin) in [(0u32, &a), (1u32, &b)] {
                let mut p = pin.get().unwrap();
                p.push(Buffer::classification(0, 0.5, Tag::new(channel, frame, 0)));
                pin.store(p);
                expected.push((channel, frame));
            }
        }
        let mut seen = Vec::new();
        while let Some(mut p) = out.get_timeout(Duration::from_millis(20)) {
            let id = p.frame_id().unwrap();
            seen.push((id.channel, id.frame));
            p.clear();
            out.store(p);
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_blocked_producer_resumes_after_recycle() {
        let c = Connector::fifo("fifo", 1, 1, 1);
        let input = c.new_input_pin().unwrap();
        let output = c.new_output_pin().unwrap();
        let mut p = input.get().unwrap();
        p.push(Buffer::classification(0, 0.5, Tag::default()));
        input.store(p);

        let producer = {
            let input = input.clone();
            thread::spawn(move || input.get().map(|p| p.len()))
        };
        thread::sleep(Duration::from_millis(20));
        let mut got = output.get().unwrap();
        got.clear();
        output.store(got);
        assert_eq!(producer.join().unwrap(), Some(0));
    }

    #[test]
    fn test_store_after_disconnect_dropped() {
        let c = Connector::fifo("fifo", 1, 1, 2);
        let cleaner = CleanerHandle::detached();
        c.set_cleaner(cleaner.clone());
        let pool = RefPool::new(1);
        let input = c.new_input_pin().unwrap();
        let output = c.new_output_pin().unwrap();

        let mut p = input.get().unwrap();
        p.push(pooled(&pool, 2));
        input.disconnect();
        input.store(p);

        // 不进入已填充队列, 空 Packet 回到空闲表, Buffer 被释放
        assert_eq!(c.queued_packets(), 0);
        assert_eq!(c.free_packets(), 2);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(cleaner.pending_len(), 1);
        assert!(output.get_timeout(Duration::from_millis(10)).is_none());
    }
}
