// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 终端 Pin: 消费而不排队
//!
//! - [`SinkPin`]: 直接释放收到的所有 Buffer
//! - [`CsvWriterPin`]: 把检测/分类结果按 ROI 写成 CSV 行, 然后释放
//!
//! 多个 Stage 共用一个终端时, 每个 Stage 用 `attach` 取得自己的 Pin,
//! 断开只影响该 Stage 自己的 Pin。

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Pin;
use crate::buffer::{BufferKind, CleanerHandle};
use crate::error::Result;
use crate::packet::Packet;
use crate::utils::lock;

/// 丢弃型 Pin, 作为 Stage 的输出端使用
pub struct SinkPin {
    cleaner: CleanerHandle,
    disconnected: AtomicBool,
    consumed: Arc<AtomicU64>,
}

impl SinkPin {
    pub fn new(cleaner: CleanerHandle) -> Arc<Self> {
        Arc::new(Self {
            cleaner,
            disconnected: AtomicBool::new(false),
            consumed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// 共享计数的新 Pin
    pub fn attach(&self) -> Arc<Self> {
        Arc::new(Self {
            cleaner: self.cleaner.clone(),
            disconnected: AtomicBool::new(false),
            consumed: self.consumed.clone(),
        })
    }

    /// 已消费的 Packet 数 (所有共享 Pin 合计)
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }
}

impl Pin for SinkPin {
    fn get(&self) -> Option<Packet> {
        if self.disconnected.load(Ordering::Acquire) {
            None
        } else {
            Some(Packet::new())
        }
    }

    fn get_timeout(&self, _timeout: Duration) -> Option<Packet> {
        self.get()
    }

    fn store(&self, mut packet: Packet) {
        for buffer in packet.drain() {
            buffer.force_release(&self.cleaner);
        }
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

/// CSV 中的一行
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CsvRow {
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
    class_id: i32,
    confidence: f32,
}

/// 结果写入 CSV
///
/// 行格式: `channel, frame, roi, left, top, right, bottom, class, conf`。
/// 同一 ROI 上的分类结果覆盖检测框的类别与置信度。
pub struct CsvWriterPin {
    file: Arc<CsvFile>,
    cleaner: CleanerHandle,
    disconnected: AtomicBool,
}

struct CsvFile {
    writer: Mutex<BufWriter<File>>,
    rows: AtomicU64,
}

impl CsvWriterPin {
    pub fn create<P: AsRef<Path>>(path: P, cleaner: CleanerHandle) -> Result<Arc<Self>> {
        let file = File::create(path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), "csv writer opened");
        Ok(Arc::new(Self {
            file: Arc::new(CsvFile {
                writer: Mutex::new(BufWriter::new(file)),
                rows: AtomicU64::new(0),
            }),
            cleaner,
            disconnected: AtomicBool::new(false),
        }))
    }

    /// 写同一文件的新 Pin
    pub fn attach(&self) -> Arc<Self> {
        Arc::new(Self {
            file: self.file.clone(),
            cleaner: self.cleaner.clone(),
            disconnected: AtomicBool::new(false),
        })
    }

    /// 已写入的行数
    pub fn rows_written(&self) -> u64 {
        self.file.rows.load(Ordering::Relaxed)
    }

    fn write_rows(&self, channel: u32, frame: u32, rows: &BTreeMap<u32, CsvRow>) -> std::io::Result<()> {
        let mut w = lock(&self.file.writer);
        for (roi, r) in rows {
            writeln!(
                w,
                "{}, {}, {}, {:.6}, {:.6}, {:.6}, {:.6}, {}, {:.6}",
                channel, frame, roi, r.left, r.top, r.right, r.bottom, r.class_id, r.confidence
            )?;
        }
        w.flush()
    }
}

impl Pin for CsvWriterPin {
    fn get(&self) -> Option<Packet> {
        if self.disconnected.load(Ordering::Acquire) {
            None
        } else {
            Some(Packet::new())
        }
    }

    fn get_timeout(&self, _timeout: Duration) -> Option<Packet> {
        self.get()
    }

    fn store(&self, mut packet: Packet) {
        let mut rows: BTreeMap<u32, CsvRow> = BTreeMap::new();
        let mut channel = 0;
        let mut frame = 0;
        for buffer in packet.drain() {
            channel = buffer.channel();
            frame = buffer.frame();
            match buffer.kind() {
                BufferKind::DetectionBox(det) => {
                    let row = rows.entry(buffer.roi_index()).or_default();
                    row.left = det.bbox.x1;
                    row.top = det.bbox.y1;
                    row.right = det.bbox.x2;
                    row.bottom = det.bbox.y2;
                    row.class_id = det.class_id;
                    row.confidence = det.confidence;
                }
                BufferKind::Classification(cls) => {
                    let row = rows.entry(buffer.roi_index()).or_default();
                    row.class_id = cls.class_id;
                    row.confidence = cls.confidence;
                }
                _ => {}
            }
            buffer.force_release(&self.cleaner);
        }
        if rows.is_empty() {
            return;
        }
        match self.write_rows(channel, frame, &rows) {
            Ok(()) => {
                self.file.rows.fetch_add(rows.len() as u64, Ordering::Relaxed);
            }
            Err(e) => tracing::error!(error = %e, "❌ CSV 写入失败"),
        }
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, Geometry, PixelFormat, Tag};
    use crate::detection::BBox;

    #[test]
    fn test_sink_releases_everything() {
        let cleaner = CleanerHandle::detached();
        let sink = SinkPin::new(cleaner.clone());
        let mut p = sink.get().unwrap();
        let b = Buffer::classification(1, 0.9, Tag::default());
        b.set_ref(3);
        p.push(b);
        sink.store(p);
        assert_eq!(cleaner.pending_len(), 1);
        assert_eq!(sink.consumed(), 1);
        sink.disconnect();
        assert!(sink.get().is_none());
    }

    #[test]
    fn test_attached_pins_disconnect_independently() {
        let sink = SinkPin::new(CleanerHandle::detached());
        let other = sink.attach();
        sink.disconnect();
        assert!(sink.is_closed());
        let p = other.get().unwrap();
        other.store(p);
        assert_eq!(sink.consumed(), 1);
    }

    #[test]
    fn test_csv_rows_grouped_by_roi() {
        let path = std::env::temp_dir().join(format!("vapipe-csv-{}.csv", std::process::id()));
        let cleaner = CleanerHandle::detached();
        let pin = CsvWriterPin::create(&path, cleaner.clone()).unwrap();

        let mut p = pin.get().unwrap();
        let geometry = Geometry::packed(8, 8, PixelFormat::Rgbp);
        p.push(Buffer::host_surface(
            Arc::new(vec![0; geometry.frame_bytes()]),
            geometry,
            Tag::new(2, 5, 0),
        ));
        p.push(Buffer::roi(BBox::new(0.1, 0.2, 0.3, 0.4), 1, 0.9, Tag::new(2, 5, 0)));
        p.push(Buffer::roi(BBox::new(0.5, 0.5, 0.6, 0.7), 3, 0.8, Tag::new(2, 5, 1)));
        p.push(Buffer::classification(7, 0.66, Tag::new(2, 5, 1)));
        pin.store(p);

        assert_eq!(pin.rows_written(), 2);
        assert_eq!(cleaner.pending_len(), 4);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "2, 5, 0, 0.100000, 0.200000, 0.300000, 0.400000, 1, 0.900000"
        );
        assert_eq!(
            lines[1],
            "2, 5, 1, 0.500000, 0.500000, 0.600000, 0.700000, 7, 0.660000"
        );
        let _ = std::fs::remove_file(&path);
    }
}
