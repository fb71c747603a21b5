// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 批处理执行器
//!
//! 把逐帧插入的图像组装成模型批次, 在固定数量的异步执行槽位上运行,
//! 并按提交顺序回收结果。
//!
//! - 槽位分为 free / busy 两个队列, 总数为流水线深度
//! - 当前累积中的批次总在 free 队首
//! - busy 队列严格按提交顺序回收, 遇到第一个未完成的槽位即停止扫描

use std::collections::VecDeque;
use std::time::Duration;

use super::backend::{InputRequirements, ModelBackend, ModelInfo, SlotStatus};
use crate::buffer::{Buffer, Tag};
use crate::error::{PipelineError, Result};
use crate::models::Postprocessor;

/// 阻塞等待时单次等待的时长
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// `insert_image` 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 已放入当前批次
    Accepted,
    /// 放入后批次已满并提交
    Submitted,
    /// 没有空闲槽位, 需要先回收
    NoFreeSlot,
}

/// `get_output` 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    /// 正常 (可能回收了若干槽位)
    Drained,
    /// 无执行中的槽位且无累积中的批次, 需要新输入
    Idle,
    /// 无执行中的槽位, 但批次仍在累积
    Accumulating,
    /// 没有空闲槽位, 插入前需要等待
    AllBusy,
}

impl OutputStatus {
    pub fn code(&self) -> i32 {
        match self {
            OutputStatus::Drained => 0,
            OutputStatus::Idle => -1,
            OutputStatus::Accumulating => -2,
            OutputStatus::AllBusy => 2,
        }
    }
}

/// 回收得到的结果
#[derive(Debug, Default)]
pub struct ExecutorOutput {
    /// 带原始 (channel, frame, roi) 标签的结果
    pub results: Vec<Buffer>,
    /// 已完成的输入图像标签, 按插入顺序
    pub completed: Vec<Tag>,
}

impl ExecutorOutput {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.completed.is_empty()
    }

    pub fn clear(&mut self) {
        self.results.clear();
        self.completed.clear();
    }

    fn append(&mut self, other: &mut ExecutorOutput) {
        self.results.append(&mut other.results);
        self.completed.append(&mut other.completed);
    }
}

#[derive(Debug)]
struct Slot {
    id: usize,
    tags: Vec<Tag>,
}

pub struct BatchExecutor {
    backend: Box<dyn ModelBackend>,
    post: Box<dyn Postprocessor>,
    batch_size: usize,
    depth: usize,
    info: Option<ModelInfo>,
    free: VecDeque<Slot>,
    busy: VecDeque<Slot>,
    // 插入时为腾出槽位而提前回收的结果
    carried: ExecutorOutput,
}

impl BatchExecutor {
    pub fn new(
        backend: Box<dyn ModelBackend>,
        post: Box<dyn Postprocessor>,
        batch_size: usize,
        depth: usize,
    ) -> Self {
        Self {
            backend,
            post,
            batch_size: batch_size.max(1),
            depth: depth.max(1),
            info: None,
            free: VecDeque::new(),
            busy: VecDeque::new(),
            carried: ExecutorOutput::default(),
        }
    }

    /// 加载模型, 分配槽位, 配置后处理器
    pub fn load(&mut self) -> Result<&ModelInfo> {
        let info = self.backend.load(self.batch_size, self.depth)?;
        if info.batch_size == 0 {
            return Err(PipelineError::ModelLoad("batch size 为 0".into()));
        }
        self.post.configure(&info)?;
        self.batch_size = info.batch_size;
        self.free = (0..self.depth)
            .map(|id| Slot {
                id,
                tags: Vec::with_capacity(self.batch_size),
            })
            .collect();
        self.busy.clear();
        tracing::info!(
            batch = self.batch_size,
            depth = self.depth,
            width = info.input.width,
            height = info.input.height,
            "✅ model loaded"
        );
        Ok(self.info.insert(info))
    }

    pub fn requirements(&self) -> InputRequirements {
        self.backend.requirements()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// 当前批次已累积的图像数
    pub fn batch_index(&self) -> usize {
        self.free.front().map(|s| s.tags.len()).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.busy.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// 非阻塞插入
    pub fn try_insert_image(&mut self, image: &Buffer, tag: Tag) -> Result<InsertOutcome> {
        let Some(slot) = self.free.front_mut() else {
            return Ok(InsertOutcome::NoFreeSlot);
        };
        self.backend.fill_input(slot.id, slot.tags.len(), image)?;
        slot.tags.push(tag);
        if slot.tags.len() >= self.batch_size {
            self.submit_front();
            Ok(InsertOutcome::Submitted)
        } else {
            Ok(InsertOutcome::Accepted)
        }
    }

    /// 阻塞插入: 没有空闲槽位时等待最早提交的槽位完成并回收
    pub fn insert_image(&mut self, image: &Buffer, tag: Tag) -> Result<InsertOutcome> {
        self.insert_image_until(image, tag, || false)
    }

    /// 阻塞插入, 每次等待后检查 `abort`; 放弃时返回 `NoFreeSlot`
    pub fn insert_image_until(
        &mut self,
        image: &Buffer,
        tag: Tag,
        abort: impl Fn() -> bool,
    ) -> Result<InsertOutcome> {
        while self.free.is_empty() {
            if !self.wait_timeout(WAIT_SLICE) {
                if abort() {
                    return Ok(InsertOutcome::NoFreeSlot);
                }
                continue;
            }
            let mut drained = ExecutorOutput::default();
            self.drain_ready(&mut drained);
            self.carried.append(&mut drained);
        }
        self.try_insert_image(image, tag)
    }

    /// 提交未满的批次, 没有累积图像时返回 false
    pub fn flush(&mut self) -> bool {
        if self.batch_index() == 0 {
            return false;
        }
        self.submit_front();
        true
    }

    fn submit_front(&mut self) {
        let Some(mut slot) = self.free.pop_front() else {
            return;
        };
        match self.backend.submit(slot.id, slot.tags.len()) {
            Ok(()) => {
                tracing::trace!(slot = slot.id, count = slot.tags.len(), "batch submitted");
                self.busy.push_back(slot);
            }
            Err(e) => {
                tracing::error!(slot = slot.id, error = %e, "❌ 批次提交失败, 该批图像无结果");
                self.carried.completed.append(&mut slot.tags);
                self.free.push_back(slot);
            }
        }
    }

    /// 阻塞直到最早提交的槽位结束
    ///
    /// 有槽位结束时返回 `Drained`; 没有执行中的槽位时立即返回 `Idle` 或 `Accumulating`
    pub fn wait(&mut self) -> OutputStatus {
        if self.busy.is_empty() {
            return if self.batch_index() == 0 {
                OutputStatus::Idle
            } else {
                OutputStatus::Accumulating
            };
        }
        while !self.wait_timeout(Duration::from_millis(100)) {}
        OutputStatus::Drained
    }

    /// 等待最早提交的槽位, 结束 (完成或失败) 返回 true
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        match self.busy.front() {
            Some(slot) => self.backend.wait(slot.id, timeout) != SlotStatus::Pending,
            None => true,
        }
    }

    /// 按提交顺序回收已完成的槽位
    pub fn get_output(&mut self, out: &mut ExecutorOutput) -> OutputStatus {
        let carried = !self.carried.is_empty();
        out.append(&mut self.carried);

        if self.busy.is_empty() {
            return if carried {
                OutputStatus::Drained
            } else if self.batch_index() == 0 {
                OutputStatus::Idle
            } else {
                OutputStatus::Accumulating
            };
        }

        let drained = self.drain_ready(out);
        if drained == 0 && !carried && self.free.is_empty() {
            OutputStatus::AllBusy
        } else {
            OutputStatus::Drained
        }
    }

    fn drain_ready(&mut self, out: &mut ExecutorOutput) -> usize {
        let mut drained = 0;
        while let Some(front) = self.busy.front() {
            let status = self.backend.poll(front.id);
            if status == SlotStatus::Pending {
                break;
            }
            let Some(mut slot) = self.busy.pop_front() else {
                break;
            };
            match status {
                SlotStatus::Ready => match self.translate(&slot) {
                    Ok(mut results) => out.results.append(&mut results),
                    Err(e) => tracing::warn!(slot = slot.id, error = %e, "⚠️ 输出解析失败"),
                },
                SlotStatus::Failed(reason) => {
                    tracing::error!(slot = slot.id, %reason, "❌ 执行失败, 该批图像无结果");
                }
                SlotStatus::Pending => {}
            }
            out.completed.append(&mut slot.tags);
            self.free.push_back(slot);
            drained += 1;
        }
        drained
    }

    fn translate(&mut self, slot: &Slot) -> Result<Vec<Buffer>> {
        let outputs = self.backend.outputs(slot.id)?;
        self.post.translate(&outputs, &slot.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferKind, Geometry, PixelFormat};
    use crate::inference::backend::{OutputInfo, OutputTensor};
    use crate::models::ClassifyPostprocessor;
    use ndarray::{ArrayD, IxDyn};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// 由测试控制完成时机的后端
    #[derive(Clone, Default)]
    struct Manual {
        // slot -> (已提交图像数, 是否完成, 是否失败)
        state: Arc<Mutex<HashMap<usize, (usize, bool, bool)>>>,
    }

    impl Manual {
        fn complete(&self, slot: usize) {
            if let Some(s) = self.state.lock().unwrap().get_mut(&slot) {
                s.1 = true;
            }
        }

        fn fail(&self, slot: usize) {
            if let Some(s) = self.state.lock().unwrap().get_mut(&slot) {
                s.1 = true;
                s.2 = true;
            }
        }

        fn complete_all(&self) {
            for s in self.state.lock().unwrap().values_mut() {
                s.1 = true;
            }
        }
    }

    impl ModelBackend for Manual {
        fn load(&mut self, batch_size: usize, _depth: usize) -> Result<ModelInfo> {
            Ok(ModelInfo {
                batch_size,
                input: self.requirements(),
                outputs: vec![OutputInfo {
                    name: "prob".into(),
                    shape: vec![batch_size, 3],
                }],
            })
        }

        fn requirements(&self) -> InputRequirements {
            InputRequirements::new(4, 4, PixelFormat::Rgbp)
        }

        fn fill_input(&mut self, _slot: usize, _index: usize, _image: &Buffer) -> Result<()> {
            Ok(())
        }

        fn submit(&mut self, slot: usize, count: usize) -> Result<()> {
            self.state.lock().unwrap().insert(slot, (count, false, false));
            Ok(())
        }

        fn poll(&mut self, slot: usize) -> SlotStatus {
            match self.state.lock().unwrap().get(&slot) {
                Some((_, true, true)) => SlotStatus::Failed("device lost".into()),
                Some((_, true, false)) => SlotStatus::Ready,
                _ => SlotStatus::Pending,
            }
        }

        fn wait(&mut self, slot: usize, timeout: Duration) -> SlotStatus {
            let status = self.poll(slot);
            if status == SlotStatus::Pending {
                std::thread::sleep(timeout);
            }
            self.poll(slot)
        }

        fn outputs(&mut self, slot: usize) -> Result<Vec<OutputTensor>> {
            let count = self.state.lock().unwrap().get(&slot).map(|s| s.0).unwrap_or(0);
            // 每张图像的类别等于其批内下标
            let mut data = vec![0.0f32; count * 3];
            for b in 0..count {
                data[b * 3 + b % 3] = 1.0;
            }
            Ok(vec![OutputTensor::new(
                "prob",
                ArrayD::from_shape_vec(IxDyn(&[count, 3]), data).unwrap(),
            )])
        }
    }

    fn image() -> Buffer {
        let g = Geometry::packed(4, 4, PixelFormat::Rgbp);
        Buffer::host_surface(Arc::new(vec![0; g.frame_bytes()]), g, Tag::default())
    }

    fn executor(batch: usize, depth: usize) -> (BatchExecutor, Manual) {
        let backend = Manual::default();
        let mut exec = BatchExecutor::new(
            Box::new(backend.clone()),
            Box::new(ClassifyPostprocessor::new()),
            batch,
            depth,
        );
        exec.load().unwrap();
        (exec, backend)
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(OutputStatus::Drained.code(), 0);
        assert_eq!(OutputStatus::Idle.code(), -1);
        assert_eq!(OutputStatus::Accumulating.code(), -2);
        assert_eq!(OutputStatus::AllBusy.code(), 2);
    }

    #[test]
    fn test_idle_and_accumulating() {
        let (mut exec, _backend) = executor(2, 1);
        let mut out = ExecutorOutput::default();
        assert_eq!(exec.get_output(&mut out), OutputStatus::Idle);
        let outcome = exec.try_insert_image(&image(), Tag::new(0, 0, 0)).unwrap();
        assert_eq!(outcome, InsertOutcome::Accepted);
        assert_eq!(exec.get_output(&mut out), OutputStatus::Accumulating);
        assert!(out.is_empty());
    }

    #[test]
    fn test_batch_two_depth_one_scenario() {
        let (mut exec, backend) = executor(2, 1);
        let mut out = ExecutorOutput::default();
        exec.try_insert_image(&image(), Tag::new(0, 0, 0)).unwrap();
        let outcome = exec.try_insert_image(&image(), Tag::new(0, 1, 0)).unwrap();
        assert_eq!(outcome, InsertOutcome::Submitted);
        assert_eq!(exec.in_flight(), 1);

        // 唯一槽位执行中: 没有结果, 也没有空闲槽位
        let status = exec.get_output(&mut out);
        assert_eq!(status, OutputStatus::AllBusy);
        assert_ne!(status.code(), 0);
        assert!(out.results.is_empty());

        backend.complete(0);
        assert_eq!(exec.get_output(&mut out), OutputStatus::Drained);
        let tags: Vec<(u32, u32)> = out.results.iter().map(|b| (b.channel(), b.frame())).collect();
        assert_eq!(tags, vec![(0, 0), (0, 1)]);
        assert_eq!(out.completed.len(), 2);
        assert_eq!(exec.free_slots(), 1);
    }

    #[test]
    fn test_backpressure_no_free_slot() {
        let (mut exec, backend) = executor(1, 2);
        assert_eq!(exec.try_insert_image(&image(), Tag::new(0, 0, 0)).unwrap(), InsertOutcome::Submitted);
        assert_eq!(exec.try_insert_image(&image(), Tag::new(0, 1, 0)).unwrap(), InsertOutcome::Submitted);
        assert_eq!(exec.try_insert_image(&image(), Tag::new(0, 2, 0)).unwrap(), InsertOutcome::NoFreeSlot);

        let mut out = ExecutorOutput::default();
        assert_eq!(exec.get_output(&mut out), OutputStatus::AllBusy);
        assert_eq!(exec.try_insert_image(&image(), Tag::new(0, 2, 0)).unwrap(), InsertOutcome::NoFreeSlot);

        backend.complete(0);
        assert_eq!(exec.get_output(&mut out), OutputStatus::Drained);
        assert_eq!(exec.try_insert_image(&image(), Tag::new(0, 2, 0)).unwrap(), InsertOutcome::Submitted);
    }

    #[test]
    fn test_drain_strictly_in_submission_order() {
        let (mut exec, backend) = executor(1, 3);
        for f in 0..3 {
            exec.try_insert_image(&image(), Tag::new(0, f, 0)).unwrap();
        }
        // 后提交的先完成, 不能越过最早的槽位
        backend.complete(1);
        backend.complete(2);
        let mut out = ExecutorOutput::default();
        exec.get_output(&mut out);
        assert!(out.completed.is_empty());

        backend.complete(0);
        exec.get_output(&mut out);
        let frames: Vec<u32> = out.completed.iter().map(|t| t.frame).collect();
        assert_eq!(frames, vec![0, 1, 2]);
    }

    #[test]
    fn test_blocking_insert_carries_results() {
        let (mut exec, backend) = executor(1, 1);
        exec.insert_image(&image(), Tag::new(3, 0, 0)).unwrap();
        let completer = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                backend.complete_all();
            })
        };
        // 阻塞直到槽位 0 完成并被回收
        assert_eq!(exec.insert_image(&image(), Tag::new(3, 1, 0)).unwrap(), InsertOutcome::Submitted);
        completer.join().unwrap();

        let mut out = ExecutorOutput::default();
        assert_eq!(exec.get_output(&mut out), OutputStatus::Drained);
        assert_eq!(out.completed, vec![Tag::new(3, 0, 0)]);
    }

    #[test]
    fn test_flush_partial_batch() {
        let (mut exec, backend) = executor(4, 1);
        exec.try_insert_image(&image(), Tag::new(1, 0, 0)).unwrap();
        assert!(exec.flush());
        assert!(!exec.flush());
        backend.complete_all();
        let mut out = ExecutorOutput::default();
        exec.get_output(&mut out);
        assert_eq!(out.results.len(), 1);
        assert!(matches!(out.results[0].kind(), BufferKind::Classification(_)));
    }

    #[test]
    fn test_failed_slot_completes_without_results() {
        let (mut exec, backend) = executor(1, 1);
        exec.try_insert_image(&image(), Tag::new(0, 5, 0)).unwrap();
        backend.fail(0);
        let mut out = ExecutorOutput::default();
        assert_eq!(exec.get_output(&mut out), OutputStatus::Drained);
        assert!(out.results.is_empty());
        assert_eq!(out.completed, vec![Tag::new(0, 5, 0)]);
        assert_eq!(exec.free_slots(), 1);
    }

    #[test]
    fn test_blocking_insert_gives_up_on_abort() {
        let (mut exec, _backend) = executor(1, 1);
        exec.try_insert_image(&image(), Tag::new(0, 0, 0)).unwrap();
        assert_eq!(exec.free_slots(), 0);

        // 后端一直不完成, 中止后返回而不是一直等待
        let outcome = exec
            .insert_image_until(&image(), Tag::new(0, 1, 0), || true)
            .unwrap();
        assert_eq!(outcome, InsertOutcome::NoFreeSlot);
        assert_eq!(exec.in_flight(), 1);
        assert_eq!(exec.batch_index(), 0);
    }

    #[test]
    fn test_wait_reports_status() {
        let (mut exec, backend) = executor(2, 1);
        assert_eq!(exec.wait(), OutputStatus::Idle);
        exec.try_insert_image(&image(), Tag::new(0, 0, 0)).unwrap();
        assert_eq!(exec.wait(), OutputStatus::Accumulating);
        exec.try_insert_image(&image(), Tag::new(0, 1, 0)).unwrap();
        backend.complete(0);
        assert_eq!(exec.wait(), OutputStatus::Drained);
        let mut out = ExecutorOutput::default();
        assert_eq!(exec.get_output(&mut out), OutputStatus::Drained);
        assert_eq!(out.completed.len(), 2);
    }
}
