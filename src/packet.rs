// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! Packet: 在 Stage 之间整体传递的一组有序 Buffer

use crate::buffer::{Buffer, FrameId};

/// 有序 Buffer 序列
///
/// `owner` 记录分配它的 Connector, 用于检测错投到其他 Connector 的 Packet;
/// 自由构造的 Packet 的 owner 为 0, 不属于任何 Connector。
#[derive(Debug, Default)]
pub struct Packet {
    buffers: Vec<Buffer>,
    owner: u64,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_owner(owner: u64) -> Self {
        Self {
            buffers: Vec::new(),
            owner,
        }
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn push(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    pub fn extend<I: IntoIterator<Item = Buffer>>(&mut self, buffers: I) {
        self.buffers.extend(buffers);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Buffer> {
        self.buffers.iter()
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// 取出全部 Buffer, 保留容量以便复用
    pub fn drain(&mut self) -> std::vec::Drain<'_, Buffer> {
        self.buffers.drain(..)
    }

    /// 第一个 Buffer 的通道号, 分片路由使用
    pub fn channel(&self) -> Option<u32> {
        self.buffers.first().map(|b| b.channel())
    }

    pub fn frame_id(&self) -> Option<FrameId> {
        self.buffers.first().map(|b| b.frame_id())
    }
}

impl<'a> IntoIterator for &'a Packet {
    type Item = &'a Buffer;
    type IntoIter = std::slice::Iter<'a, Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Tag;

    #[test]
    fn test_insertion_order() {
        let mut p = Packet::new();
        for i in 0..4 {
            p.push(Buffer::classification(i, 0.5, Tag::new(2, i as u32, 0)));
        }
        let frames: Vec<u32> = p.iter().map(|b| b.frame()).collect();
        assert_eq!(frames, vec![0, 1, 2, 3]);
        assert_eq!(p.channel(), Some(2));
        p.clear();
        assert!(p.is_empty());
        assert_eq!(p.channel(), None);
    }
}
