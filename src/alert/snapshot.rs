use std::collections::VecDeque;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::frame::{BoundingBox, Frame};

pub const DEFAULT_MAX_SAVED_IMAGES: usize = 1000;
pub const DEFAULT_IMAGE_QUALITY: u8 = 95;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 2;

/// Alert snapshots on disk, capped at `max_images` files.
///
/// The store is shared by every task; the cap is global. Files already in
/// the directory at open time count against the cap, oldest first, so the
/// limit holds across restarts.
pub struct SnapshotStore {
    dir: PathBuf,
    max_images: usize,
    quality: u8,
    base_url: Option<String>,
    saved: Mutex<VecDeque<PathBuf>>,
}

impl SnapshotStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        max_images: usize,
        quality: u8,
        base_url: Option<String>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
        let existing = index_existing(&dir)?;
        let store = Self {
            dir,
            max_images: max_images.max(1),
            quality: quality.clamp(1, 100),
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            saved: Mutex::new(existing.into()),
        };
        store.evict_excess();
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `frame` with `bbox` outlined and return the image reference:
    /// `<base_url>/<file>` when a base URL is configured, else the path.
    pub fn save(
        &self,
        frame: &Frame,
        bbox: &BoundingBox,
        class: &str,
        alert_id: &str,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let mut image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| {
                anyhow!("frame buffer does not match {}x{}", frame.width, frame.height)
            })?;
        draw_box(&mut image, bbox);

        let name = snapshot_name(class, alert_id, at);
        let path = self.dir.join(&name);
        let file = fs::File::create(&path)
            .with_context(|| format!("create snapshot {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, self.quality)
            .encode_image(&image)
            .with_context(|| format!("encode snapshot {}", path.display()))?;
        drop(writer);

        self.lock().push_back(path.clone());
        self.evict_excess();

        Ok(match &self.base_url {
            Some(base) => format!("{}/{}", base, name),
            None => path.display().to_string(),
        })
    }

    fn evict_excess(&self) {
        let mut saved = self.lock();
        while saved.len() > self.max_images {
            let Some(oldest) = saved.pop_front() else {
                break;
            };
            if let Err(e) = fs::remove_file(&oldest) {
                log::warn!("snapshot eviction failed for {}: {}", oldest.display(), e);
            } else {
                log::debug!("snapshot evicted: {}", oldest.display());
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PathBuf>> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn index_existing(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified()).ok();
        files.push((modified, path));
    }
    files.sort();
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

/// `<class>_<YYYYmmdd_HHMMSS_mmm>_<alert_id>.jpg`, local time.
fn snapshot_name(class: &str, alert_id: &str, at: DateTime<Utc>) -> String {
    let class: String = class
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!(
        "{}_{}_{}.jpg",
        class,
        at.with_timezone(&Local).format("%Y%m%d_%H%M%S_%3f"),
        alert_id
    )
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox) {
    let (w, h) = (image.width(), image.height());
    let b = bbox.clamp_to(w as f32, h as f32);
    if b.w <= 0.0 || b.h <= 0.0 {
        return;
    }
    let x0 = b.x as u32;
    let y0 = b.y as u32;
    let x1 = ((b.x + b.w) as u32).min(w - 1);
    let y1 = ((b.y + b.h) as u32).min(h - 1);
    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            put(image, x, y0 + t);
            put(image, x, y1.saturating_sub(t));
        }
        for y in y0..=y1 {
            put(image, x0 + t, y);
            put(image, x1.saturating_sub(t), y);
        }
    }
}

fn put(image: &mut RgbImage, x: u32, y: u32) {
    if x < image.width() && y < image.height() {
        image.put_pixel(x, y, BOX_COLOR);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
