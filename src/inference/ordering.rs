// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 输出排序协调器
//!
//! 只有部分输入需要模型执行, 执行结果的返回时间不可预测。
//! 不需要执行的输入挂在最近一次提交执行的 (channel, frame) 上,
//! 该帧完成时先输出它自己, 再按到达顺序输出挂在它上面的输入。
//! 没有执行中的帧时, 不需要执行的输入直接输出。

use std::collections::{HashMap, VecDeque};

use crate::buffer::FrameId;
use crate::packet::Packet;

/// 同一帧多次提交时合并负载
pub trait Merge {
    fn merge(&mut self, other: Self);
}

impl Merge for Packet {
    fn merge(&mut self, mut other: Packet) {
        self.extend(other.drain());
    }
}

struct Record<T> {
    payload: T,
    // 尚未完成的执行图像数
    outstanding: usize,
}

pub struct OrderingCoordinator<T> {
    records: HashMap<FrameId, Record<T>>,
    // 执行中的帧, 按首次提交顺序
    order: VecDeque<FrameId>,
    dependents: HashMap<FrameId, Vec<T>>,
    last_exec: Option<FrameId>,
}

impl<T: Merge> Default for OrderingCoordinator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Merge> OrderingCoordinator<T> {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            dependents: HashMap::new(),
            last_exec: None,
        }
    }

    /// 登记一个输入
    ///
    /// `exec_count > 0` 表示该帧有 `exec_count` 张图像送入执行器, 负载暂存到完成;
    /// 否则在有执行中的帧时挂起, 没有时原样返回, 由调用方立即输出。
    pub fn submit(&mut self, id: FrameId, payload: T, exec_count: usize) -> Option<T> {
        if exec_count > 0 {
            match self.records.get_mut(&id) {
                Some(record) => {
                    record.payload.merge(payload);
                    record.outstanding += exec_count;
                }
                None => {
                    self.records.insert(
                        id,
                        Record {
                            payload,
                            outstanding: exec_count,
                        },
                    );
                    self.order.push_back(id);
                }
            }
            self.last_exec = Some(id);
            return None;
        }

        match self.last_exec {
            Some(last) if self.records.contains_key(&last) => {
                tracing::trace!(frame = %id, pending_on = %last, "挂起等待执行结果");
                self.dependents.entry(last).or_default().push(payload);
                None
            }
            _ => Some(payload),
        }
    }

    /// 执行中帧的负载, 用于追加结果
    pub fn record_mut(&mut self, id: &FrameId) -> Option<&mut T> {
        self.records.get_mut(id).map(|r| &mut r.payload)
    }

    /// 该帧的一张图像执行完成; 全部完成时返回该帧及挂在它上面的输入
    pub fn complete_one(&mut self, id: &FrameId) -> Vec<T> {
        let Some(record) = self.records.get_mut(id) else {
            tracing::warn!(frame = %id, "⚠️ 完成了未登记的帧, 忽略");
            return Vec::new();
        };
        record.outstanding = record.outstanding.saturating_sub(1);
        if record.outstanding > 0 {
            return Vec::new();
        }
        let mut emitted = Vec::new();
        self.release(id, &mut emitted);
        emitted
    }

    /// 输出全部暂存内容 (按提交顺序), 用于输入结束或停止
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut emitted = Vec::new();
        while let Some(id) = self.order.front().copied() {
            self.release(&id, &mut emitted);
        }
        emitted
    }

    /// 执行中的帧数
    pub fn outstanding(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.dependents.is_empty()
    }

    fn release(&mut self, id: &FrameId, emitted: &mut Vec<T>) {
        if let Some(record) = self.records.remove(id) {
            emitted.push(record.payload);
        }
        self.order.retain(|o| o != id);
        if let Some(pending) = self.dependents.remove(id) {
            emitted.extend(pending);
        }
        if self.last_exec.as_ref() == Some(id) {
            self.last_exec = None;
        }
    }
}
