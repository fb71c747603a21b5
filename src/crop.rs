// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 裁剪 Stage: 把检测框从整帧中裁出并缩放到分类模型输入尺寸
//!
//! 输出表面的计数单元来自本 Stage 的 `RefPool`, 池满时轮询等待下游释放。

use std::sync::Arc;

use image::{imageops, RgbImage};

use crate::buffer::{planar_rgb, Buffer, BufferKind, Geometry, PixelFormat, RefPool, Tag};
use crate::detection::BBox;
use crate::packet::Packet;
use crate::stage::{LoopControl, StageContext, StageLogic};

/// 裁剪配置
#[derive(Debug, Clone)]
pub struct CropOptions {
    pub width: u32,
    pub height: u32,
    /// 保持宽高比, 空白处填黑
    pub keep_aspect_ratio: bool,
    /// 同时在途的裁剪输出数
    pub pool_size: usize,
}

impl Default for CropOptions {
    fn default() -> Self {
        Self {
            width: 224,
            height: 224,
            keep_aspect_ratio: false,
            pool_size: 64,
        }
    }
}

pub struct CropStage {
    options: CropOptions,
    pool: Arc<RefPool>,
}

impl CropStage {
    pub fn new(options: CropOptions) -> Self {
        let pool = RefPool::new(options.pool_size.max(1));
        Self { options, pool }
    }

    pub fn pool(&self) -> &Arc<RefPool> {
        &self.pool
    }

    /// 裁出归一化区域并缩放到输出尺寸
    pub fn crop(&self, frame: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
        let (fw, fh) = frame.dimensions();
        let bbox = bbox.clamped();
        let x = (bbox.x1 * fw as f32) as u32;
        let y = (bbox.y1 * fh as f32) as u32;
        let w = ((bbox.width() * fw as f32) as u32).min(fw.saturating_sub(x));
        let h = ((bbox.height() * fh as f32) as u32).min(fh.saturating_sub(y));
        if w == 0 || h == 0 {
            return None;
        }
        let region = imageops::crop_imm(frame, x, y, w, h).to_image();
        let (ow, oh) = (self.options.width, self.options.height);
        if !self.options.keep_aspect_ratio {
            return Some(imageops::resize(&region, ow, oh, imageops::FilterType::Triangle));
        }
        let scale = (ow as f32 / w as f32).min(oh as f32 / h as f32);
        let (sw, sh) = (
            ((w as f32 * scale) as u32).clamp(1, ow),
            ((h as f32 * scale) as u32).clamp(1, oh),
        );
        let scaled = imageops::resize(&region, sw, sh, imageops::FilterType::Triangle);
        let mut canvas = RgbImage::new(ow, oh);
        imageops::replace(&mut canvas, &scaled, ((ow - sw) / 2) as i64, ((oh - sh) / 2) as i64);
        Some(canvas)
    }
}

impl StageLogic for CropStage {
    fn run_loop(&mut self, ctx: &mut StageContext) -> LoopControl {
        let Some(mut input) = ctx.acquire_input() else {
            return LoopControl::Finish;
        };
        let Some(mut output) = ctx.dequeue_output() else {
            ctx.release_input(input);
            return LoopControl::Finish;
        };
        let buffers: Vec<Buffer> = input.drain().collect();
        ctx.release_input(input);

        let frame = buffers
            .iter()
            .find(|b| matches!(b.kind(), BufferKind::HostSurface(_)))
            .and_then(|b| b.to_rgb_image());

        let cleaner = ctx.cleaner();
        let mut crops = Packet::new();
        for buffer in buffers {
            if let (BufferKind::DetectionBox(det), Some(frame)) = (buffer.kind(), &frame) {
                if let Some(crop) = self.crop(frame, &det.bbox) {
                    let Some(slot) = self.pool.acquire_wait(1, || ctx.is_stopped()) else {
                        buffer.force_release(cleaner);
                        continue;
                    };
                    let tag = Tag::new(buffer.channel(), buffer.frame(), buffer.roi_index());
                    let geometry = Geometry::packed(crop.width(), crop.height(), PixelFormat::Rgbp);
                    match Buffer::host_surface_pooled(
                        Arc::new(planar_rgb(&crop)),
                        geometry,
                        tag,
                        self.pool.clone(),
                        slot,
                    ) {
                        Some(out) => crops.push(out),
                        None => tracing::error!(slot, "❌ 裁剪池下标越界"),
                    }
                }
            }
            buffer.unref_into(cleaner, &mut output);
        }
        if !crops.is_empty() {
            tracing::trace!(stage = %ctx.name(), count = crops.len(), "rois cropped");
        }
        output.extend(crops.drain());
        ctx.enqueue_output(output);
        LoopControl::Continue
    }
}
