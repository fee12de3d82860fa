//! Decoded video frames and box geometry.
//!
//! - `Frame`: one RGB24 image as produced by a stream source. Pixel data is
//!   shared so the runner, the snapshot writer and overlay subscribers can hold
//!   the same frame without copying.
//! - `BoundingBox`: axis-aligned `x, y, w, h` box, used both in model input
//!   space and in source-frame pixel space.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded RGB24 frame.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Monotonic per-source sequence number, starting at 1.
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Wrap RGB24 bytes. Fails when the length does not match the dimensions.
    pub fn from_rgb(
        data: Vec<u8>,
        width: u32,
        height: u32,
        seq: u64,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, InferenceError> {
        let expected = rgb_len(width, height).ok_or_else(|| {
            InferenceError::BadInput(format!("frame dimensions {width}x{height} overflow"))
        })?;
        if width == 0 || height == 0 {
            return Err(InferenceError::BadInput(format!(
                "frame has empty dimensions {width}x{height}"
            )));
        }
        if data.len() != expected {
            return Err(InferenceError::BadInput(format!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            seq,
            captured_at,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// RGB triple at `(x, y)`. Out-of-range coordinates are clamped.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let x = x.min(self.width.saturating_sub(1)) as usize;
        let y = y.min(self.height.saturating_sub(1)) as usize;
        let idx = (y * self.width as usize + x) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("seq", &self.seq)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
}

// ----------------------------------------------------------------------------
// BoundingBox
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Build from corner coordinates.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            w: (x2 - x1).abs(),
            h: (y2 - y1).abs(),
        }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Intersection over union. Zero when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Scale by independent horizontal and vertical factors.
    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            w: self.w * sx,
            h: self.h * sy,
        }
    }

    /// Clip to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: f32, height: f32) -> Self {
        let x1 = self.x.clamp(0.0, width);
        let y1 = self.y.clamp(0.0, height);
        let x2 = (self.x + self.w).clamp(0.0, width);
        let y2 = (self.y + self.h).clamp(0.0, height);
        Self::from_corners(x1, y1, x2, y2)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
