// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线数据单元 Buffer
//!
//! Buffer 是带标签的共享句柄 (`Arc`), 变体负载见 [`BufferKind`]。
//! 逻辑引用计数与句柄克隆无关: 生产者按下游读者数 `set_ref(n)`,
//! 每个读者用完后调用 `unref`, 计数归零时 Buffer 恰好一次进入清理队列,
//! 由后台清理线程释放底层资源。

pub mod cleaner;
pub mod refcount;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{DynamicImage, RgbImage};

use crate::detection::{BBox, Detection};
use crate::packet::Packet;

pub use cleaner::{Cleaner, CleanerHandle};
pub use refcount::{RefCount, RefPool};

// ========== 标识 ==========

/// 通道/帧/ROI 标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tag {
    pub channel: u32,
    pub frame: u32,
    pub roi: u32,
}

impl Tag {
    pub fn new(channel: u32, frame: u32, roi: u32) -> Self {
        Self {
            channel,
            frame,
            roi,
        }
    }

    pub fn frame_id(&self) -> FrameId {
        FrameId {
            channel: self.channel,
            frame: self.frame,
        }
    }
}

/// (通道, 帧) 标识, 排序协调器的键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId {
    pub channel: u32,
    pub frame: u32,
}

impl FrameId {
    pub fn new(channel: u32, frame: u32) -> Self {
        Self { channel, frame }
    }

    pub fn key(&self) -> u64 {
        ((self.channel as u64) << 32) | self.frame as u64
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.channel, self.frame)
    }
}

// ========== 像素格式与几何 ==========

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PixelFormat {
    /// 平面 RGB (R/G/B 三个平面)
    Rgbp,
    /// Y 平面 + 交错 UV 平面
    Nv12,
    /// 交错 BGRA
    Bgra,
}

impl PixelFormat {
    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Rgbp => 0x5042_4752,
            PixelFormat::Nv12 => 0x3231_564e,
            PixelFormat::Bgra => 0x4152_4742,
        }
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        match code {
            0x5042_4752 => Some(PixelFormat::Rgbp),
            0x3231_564e => Some(PixelFormat::Nv12),
            0x4152_4742 => Some(PixelFormat::Bgra),
            _ => None,
        }
    }
}

/// 表面几何信息, pitch 为每行字节数 (平面格式按单个平面计)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: PixelFormat,
}

impl Geometry {
    /// 紧凑排列的几何信息
    pub fn packed(width: u32, height: u32, format: PixelFormat) -> Self {
        let pitch = match format {
            PixelFormat::Bgra => width * 4,
            PixelFormat::Rgbp | PixelFormat::Nv12 => width,
        };
        Self {
            width,
            height,
            pitch,
            format,
        }
    }

    /// 整帧字节数
    pub fn frame_bytes(&self) -> usize {
        let plane = self.pitch as usize * self.height as usize;
        match self.format {
            PixelFormat::Rgbp => plane * 3,
            PixelFormat::Nv12 => plane * 3 / 2,
            PixelFormat::Bgra => plane,
        }
    }
}

// ========== 变体负载 ==========

/// 加速器表面句柄 (不透明)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

/// 资源释放钩子, 清理线程在销毁加速器表面时调用
pub type ReleaseHook = Arc<dyn Fn(SurfaceHandle) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct AcceleratorSurface {
    pub handle: SurfaceHandle,
    pub geometry: Geometry,
    pub release: Option<ReleaseHook>,
}

impl fmt::Debug for AcceleratorSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorSurface")
            .field("handle", &self.handle)
            .field("geometry", &self.geometry)
            .field("release", &self.release.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HostSurface {
    pub data: Arc<Vec<u8>>, // 与生产者池共享, 避免复制
    pub geometry: Geometry,
}

/// 码流传输用的字节块
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub data: Arc<Vec<u8>>,
    pub offset: usize,
    pub len: usize,
}

impl RawBlock {
    /// 有效字节, 越界时为空
    pub fn bytes(&self) -> &[u8] {
        self.offset
            .checked_add(self.len)
            .and_then(|end| self.data.get(self.offset..end))
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationResult {
    pub class_id: i32,
    pub confidence: f32,
}

/// Buffer 变体
#[derive(Debug, Clone)]
pub enum BufferKind {
    AcceleratorSurface(AcceleratorSurface),
    HostSurface(HostSurface),
    RawBlock(RawBlock),
    DetectionBox(Detection),
    Classification(ClassificationResult),
}

impl BufferKind {
    pub fn name(&self) -> &'static str {
        match self {
            BufferKind::AcceleratorSurface(_) => "accelerator-surface",
            BufferKind::HostSurface(_) => "host-surface",
            BufferKind::RawBlock(_) => "raw-block",
            BufferKind::DetectionBox(_) => "detection-box",
            BufferKind::Classification(_) => "classification",
        }
    }
}

/// 交错 RGB 转平面 RGBP (紧凑排列)
pub fn planar_rgb(rgb: &RgbImage) -> Vec<u8> {
    let (w, h) = rgb.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0u8; plane * 3];
    for (i, px) in rgb.pixels().enumerate() {
        data[i] = px[0];
        data[plane + i] = px[1];
        data[2 * plane + i] = px[2];
    }
    data
}

// ========== Buffer ==========

struct BufferData {
    tag: Tag,
    kind: BufferKind,
    refs: RefCount,
    // 保证只进入一次清理队列
    enqueued: AtomicBool,
}

/// 带引用计数的共享数据单元
#[derive(Clone)]
pub struct Buffer(Arc<BufferData>);

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("tag", &self.0.tag)
            .field("kind", &self.0.kind)
            .field("refs", &self.0.refs.get())
            .finish()
    }
}

impl Buffer {
    pub fn new(kind: BufferKind, tag: Tag, refs: RefCount) -> Self {
        Buffer(Arc::new(BufferData {
            tag,
            kind,
            refs,
            enqueued: AtomicBool::new(false),
        }))
    }

    /// 加速器表面
    pub fn accelerator_surface(
        handle: SurfaceHandle,
        geometry: Geometry,
        tag: Tag,
        release: Option<ReleaseHook>,
    ) -> Self {
        Self::new(
            BufferKind::AcceleratorSurface(AcceleratorSurface {
                handle,
                geometry,
                release,
            }),
            tag,
            RefCount::internal(),
        )
    }

    /// 主机内存表面
    pub fn host_surface(data: Arc<Vec<u8>>, geometry: Geometry, tag: Tag) -> Self {
        Self::new(
            BufferKind::HostSurface(HostSurface { data, geometry }),
            tag,
            RefCount::internal(),
        )
    }

    /// 主机内存表面, 计数单元来自生产者的池
    pub fn host_surface_pooled(
        data: Arc<Vec<u8>>,
        geometry: Geometry,
        tag: Tag,
        pool: Arc<RefPool>,
        slot: usize,
    ) -> Option<Self> {
        let refs = RefCount::external(pool, slot)?;
        Some(Self::new(
            BufferKind::HostSurface(HostSurface { data, geometry }),
            tag,
            refs,
        ))
    }

    /// 由 `image` 图像转换为平面 RGBP 主机表面
    pub fn from_image(img: &DynamicImage, tag: Tag) -> Self {
        let rgb = img.to_rgb8();
        let (w, h) = rgb.dimensions();
        Self::host_surface(
            Arc::new(planar_rgb(&rgb)),
            Geometry::packed(w, h, PixelFormat::Rgbp),
            tag,
        )
    }

    /// 平面 RGBP 主机表面转为交错 RGB 图像, 其他变体返回 None
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        let BufferKind::HostSurface(surface) = &self.0.kind else {
            return None;
        };
        let g = surface.geometry;
        if g.format != PixelFormat::Rgbp || surface.data.len() < g.frame_bytes() {
            return None;
        }
        let (w, h, pitch) = (g.width as usize, g.height as usize, g.pitch as usize);
        let plane = pitch * h;
        let mut pixels = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                let at = y * pitch + x;
                pixels.push(surface.data[at]);
                pixels.push(surface.data[plane + at]);
                pixels.push(surface.data[2 * plane + at]);
            }
        }
        RgbImage::from_raw(g.width, g.height, pixels)
    }

    /// 检测框 (归一化坐标)
    pub fn roi(bbox: BBox, class_id: i32, confidence: f32, tag: Tag) -> Self {
        Self::new(
            BufferKind::DetectionBox(Detection {
                bbox,
                class_id,
                confidence,
            }),
            tag,
            RefCount::internal(),
        )
    }

    /// 分类结果
    pub fn classification(class_id: i32, confidence: f32, tag: Tag) -> Self {
        Self::new(
            BufferKind::Classification(ClassificationResult {
                class_id,
                confidence,
            }),
            tag,
            RefCount::internal(),
        )
    }

    /// 码流字节块
    pub fn raw_block(data: Arc<Vec<u8>>, offset: usize, len: usize, tag: Tag) -> Self {
        Self::new(
            BufferKind::RawBlock(RawBlock { data, offset, len }),
            tag,
            RefCount::internal(),
        )
    }

    pub fn tag(&self) -> Tag {
        self.0.tag
    }

    pub fn channel(&self) -> u32 {
        self.0.tag.channel
    }

    pub fn frame(&self) -> u32 {
        self.0.tag.frame
    }

    pub fn roi_index(&self) -> u32 {
        self.0.tag.roi
    }

    pub fn frame_id(&self) -> FrameId {
        self.0.tag.frame_id()
    }

    pub fn kind(&self) -> &BufferKind {
        &self.0.kind
    }

    /// 表面几何信息 (非表面变体返回 None)
    pub fn geometry(&self) -> Option<&Geometry> {
        match &self.0.kind {
            BufferKind::AcceleratorSurface(s) => Some(&s.geometry),
            BufferKind::HostSurface(s) => Some(&s.geometry),
            _ => None,
        }
    }

    pub fn ref_count(&self) -> i32 {
        self.0.refs.get()
    }

    pub fn set_ref(&self, count: i32) {
        self.0.refs.set(count);
    }

    pub fn is_enqueued(&self) -> bool {
        self.0.enqueued.load(Ordering::Acquire)
    }

    /// 同一底层 Buffer
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// 已交给清理队列的 Buffer 再次被释放: 记录并忽略
    ///
    /// 池化计数单元此时可能已被新的帧复用, 不能再修改
    fn released_again(&self, op: &str) -> bool {
        if self.0.enqueued.load(Ordering::Acquire) {
            tracing::warn!(tag = ?self.0.tag, op, "⚠️ Buffer 已释放, 忽略多余的释放");
            return true;
        }
        false
    }

    /// 计数减一, 归零时交给清理队列
    pub fn unref(self, cleaner: &CleanerHandle) {
        if self.released_again("unref") {
            return;
        }
        match self.0.refs.decrement() {
            Some(prev) if prev > 1 => {}
            _ => self.hand_to_cleaner(cleaner),
        }
    }

    /// 计数减一; 仍有读者时追加回 packet 继续传递, 否则交给清理队列
    pub fn unref_into(self, cleaner: &CleanerHandle, packet: &mut Packet) {
        if self.released_again("unref_into") {
            return;
        }
        match self.0.refs.decrement() {
            Some(prev) if prev > 1 => packet.push(self),
            _ => self.hand_to_cleaner(cleaner),
        }
    }

    /// 计数清零并立即交给清理队列 (Sink 使用)
    pub fn force_release(self, cleaner: &CleanerHandle) {
        if self.released_again("force_release") {
            return;
        }
        self.0.refs.set(0);
        self.hand_to_cleaner(cleaner);
    }

    fn hand_to_cleaner(self, cleaner: &CleanerHandle) {
        if !self.0.enqueued.swap(true, Ordering::AcqRel) {
            cleaner.enqueue(self);
        }
    }

    /// 释放底层资源, 仅由清理线程调用
    pub(crate) fn release_resources(&self) -> Result<(), String> {
        match &self.0.kind {
            BufferKind::AcceleratorSurface(AcceleratorSurface {
                handle,
                release: Some(hook),
                ..
            }) => hook(*handle),
            _ => Ok(()),
        }
    }
}
