// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 通道分片轮询策略
//!
//! 空闲 Packet 由所有输入共享; 已填充 Packet 按 `channel % 分片数`
//! 路由到对应输出分片, 每个分片一把锁和一个条件变量,
//! 不同分片上的生产者/消费者互不争用。

use std::time::Instant;

use super::PacketQueue;
use crate::packet::Packet;

pub(crate) struct ShardedQueues {
    free: PacketQueue,
    shards: Vec<PacketQueue>,
}

impl ShardedQueues {
    pub(crate) fn new(owner: u64, pool_size: usize, shard_count: usize) -> Self {
        Self {
            free: PacketQueue::filled((0..pool_size).map(|_| Packet::with_owner(owner))),
            shards: (0..shard_count.max(1)).map(|_| PacketQueue::new()).collect(),
        }
    }

    /// 空 Packet 路由到 0 号分片
    pub(crate) fn shard_of(&self, packet: &Packet) -> usize {
        packet
            .channel()
            .map(|c| c as usize % self.shards.len())
            .unwrap_or(0)
    }

    pub(crate) fn take_free(
        &self,
        deadline: Option<Instant>,
        abort: impl Fn(bool) -> bool,
    ) -> Option<Packet> {
        self.free.pop_wait(deadline, abort)
    }

    /// 目标分片已关闭时退回 Packet
    pub(crate) fn store_filled(&self, packet: Packet) -> Result<(), Packet> {
        let shard = self.shard_of(&packet);
        self.shards[shard].push_back_open(packet)
    }

    /// 关闭分片, 返回积压的 Packet
    pub(crate) fn close_shard(&self, shard: usize) -> Vec<Packet> {
        self.shards.get(shard).map(|s| s.close()).unwrap_or_default()
    }

    pub(crate) fn take_filled(
        &self,
        shard: usize,
        deadline: Option<Instant>,
        abort: impl Fn(bool) -> bool,
    ) -> Option<Packet> {
        self.shards.get(shard)?.pop_wait(deadline, abort)
    }

    pub(crate) fn recycle(&self, packet: Packet) {
        self.free.push_front(packet);
    }

    pub(crate) fn wake_all(&self) {
        self.free.wake_all();
        for shard in &self.shards {
            shard.wake_all();
        }
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn filled_len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub(crate) fn shard_len(&self, shard: usize) -> usize {
        self.shards.get(shard).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::{Buffer, CleanerHandle, Tag};
    use crate::connector::{Connector, Pin};
    use rand::Rng;
    use std::time::Duration;

    #[test]
    fn test_channel_affinity_and_order() {
        let shards = 3usize;
        let c = Connector::sharded("rr", 1, shards, 64);
        let input = c.new_input_pin().unwrap();
        let outputs: Vec<_> = (0..shards).map(|_| c.new_output_pin().unwrap()).collect();

        let mut rng = rand::thread_rng();
        let mut sent: Vec<Vec<(u32, u32)>> = vec![Vec::new(); shards];
        let mut next_frame = [0u32; 8];
        for _ in 0..60 {
            let channel = rng.gen_range(0..8u32);
            let frame = next_frame[channel as usize];
            next_frame[channel as usize] += 1;
            let mut p = input.get().unwrap();
            p.push(Buffer::classification(0, 0.5, Tag::new(channel, frame, 0)));
            input.store(p);
            sent[channel as usize % shards].push((channel, frame));
        }

        for (shard, out) in outputs.iter().enumerate() {
            let mut seen = Vec::new();
            while let Some(mut p) = out.get_timeout(Duration::from_millis(10)) {
                let id = p.frame_id().unwrap();
                assert_eq!(id.channel as usize % shards, shard);
                seen.push((id.channel, id.frame));
                p.clear();
                out.store(p);
            }
            assert_eq!(seen, sent[shard]);
        }
    }

    #[test]
    fn test_empty_packet_routes_to_first_shard() {
        let c = Connector::sharded("rr", 1, 2, 2);
        let input = c.new_input_pin().unwrap();
        let first = c.new_output_pin().unwrap();
        let second = c.new_output_pin().unwrap();
        let p = input.get().unwrap();
        input.store(p);
        assert!(second.get_timeout(Duration::from_millis(10)).is_none());
        assert!(first.get_timeout(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_closed_shard_does_not_starve_producer() {
        let c = Connector::sharded("rr", 1, 2, 1);
        let cleaner = CleanerHandle::detached();
        c.set_cleaner(cleaner.clone());
        let input = c.new_input_pin().unwrap();
        let first = c.new_output_pin().unwrap();
        let second = c.new_output_pin().unwrap();

        // 通道 1 积压一帧后, 其消费者离开
        let mut p = input.get().unwrap();
        p.push(Buffer::classification(0, 0.5, Tag::new(1, 0, 0)));
        input.store(p);
        second.disconnect();
        assert_eq!(c.queued_packets(), 0);
        assert_eq!(cleaner.pending_len(), 1);

        // 池只有两个 Packet, 继续发往通道 1 也不会耗尽
        for frame in 1..6 {
            let mut p = input.get_timeout(Duration::from_millis(100)).unwrap();
            p.push(Buffer::classification(0, 0.5, Tag::new(1, frame, 0)));
            input.store(p);
        }
        assert_eq!(c.free_packets(), 2);
        assert_eq!(cleaner.pending_len(), 6);

        let mut p = input.get().unwrap();
        p.push(Buffer::classification(0, 0.5, Tag::new(0, 0, 0)));
        input.store(p);
        assert_eq!(first.get_timeout(Duration::from_millis(10)).unwrap().frame_id().unwrap().channel, 0);
    }
}
