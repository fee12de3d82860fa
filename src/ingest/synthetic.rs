//! Synthetic `stub://` source for tests and demos.
//!
//! Query parameters shape the stream and inject faults:
//! - `width`, `height`: frame size (default 64x48)
//! - `fps`: overrides the descriptor rate
//! - `fail_connect=N`: the first N connect attempts fail
//! - `unreachable=true`: every connect attempt fails
//! - `drop_after=N`: each session ends after N frames
//! - `connect_delay_ms=N`: connecting takes N ms (timeout testing)

use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::StreamError;
use crate::frame::Frame;

use super::VideoSourceDescriptor;

const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;

pub(crate) struct SyntheticReader {
    uri: String,
    width: u32,
    height: u32,
    period: Duration,
    fail_connect: u32,
    unreachable: bool,
    drop_after: Option<u64>,
    connect_delay: Duration,
    connect_attempts: u32,
    session_frames: u64,
    connected: bool,
    next_due: Option<Instant>,
}

impl SyntheticReader {
    pub(crate) fn new(descriptor: &VideoSourceDescriptor) -> Result<Self, StreamError> {
        let parsed = url::Url::parse(&descriptor.uri)
            .map_err(|e| StreamError::Unsupported(format!("{}: {}", descriptor.uri, e)))?;
        let mut reader = Self {
            uri: descriptor.uri.clone(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            period: frame_period(descriptor.fps),
            fail_connect: 0,
            unreachable: false,
            drop_after: None,
            connect_delay: Duration::ZERO,
            connect_attempts: 0,
            session_frames: 0,
            connected: false,
            next_due: None,
        };
        for (key, value) in parsed.query_pairs() {
            let bad = || {
                StreamError::Unsupported(format!(
                    "{}: bad value for {}",
                    reader_uri(&descriptor.uri),
                    key
                ))
            };
            match key.as_ref() {
                "width" => reader.width = value.parse().map_err(|_| bad())?,
                "height" => reader.height = value.parse().map_err(|_| bad())?,
                "fps" => reader.period = frame_period(value.parse().map_err(|_| bad())?),
                "fail_connect" => reader.fail_connect = value.parse().map_err(|_| bad())?,
                "unreachable" => reader.unreachable = value.parse().map_err(|_| bad())?,
                "drop_after" => reader.drop_after = Some(value.parse().map_err(|_| bad())?),
                "connect_delay_ms" => {
                    reader.connect_delay = Duration::from_millis(value.parse().map_err(|_| bad())?)
                }
                other => log::debug!("stub source {}: ignoring parameter {}", reader.uri, other),
            }
        }
        if reader.width == 0 || reader.height == 0 {
            return Err(StreamError::Unsupported(format!(
                "{}: frame size must be non-zero",
                descriptor.uri
            )));
        }
        Ok(reader)
    }

    pub(crate) fn connect(&mut self, timeout: Duration) -> Result<(), StreamError> {
        self.connect_attempts += 1;
        if self.connect_delay > timeout {
            std::thread::sleep(timeout);
            return Err(StreamError::Timeout {
                uri: self.uri.clone(),
                timeout,
            });
        }
        std::thread::sleep(self.connect_delay);
        if self.unreachable || self.connect_attempts <= self.fail_connect {
            return Err(StreamError::Connect {
                uri: self.uri.clone(),
                reason: "synthetic connection refused".to_string(),
            });
        }
        self.connected = true;
        self.session_frames = 0;
        self.next_due = None;
        log::info!("stream {}: connected (synthetic)", self.uri);
        Ok(())
    }

    pub(crate) fn read(&mut self, seq: u64) -> Result<Option<Frame>, StreamError> {
        if !self.connected {
            return Err(StreamError::Read {
                uri: self.uri.clone(),
                reason: "not connected".to_string(),
            });
        }
        if self.drop_after.is_some_and(|limit| self.session_frames >= limit) {
            self.connected = false;
            return Err(StreamError::Read {
                uri: self.uri.clone(),
                reason: "synthetic connection dropped".to_string(),
            });
        }

        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.period);
        self.session_frames += 1;

        let pixels = self.generate_pixels(seq);
        let frame = Frame::from_rgb(pixels, self.width, self.height, seq, Utc::now())
            .map_err(|e| StreamError::Read {
                uri: self.uri.clone(),
                reason: e.to_string(),
            })?;
        Ok(Some(frame))
    }

    pub(crate) fn disconnect(&mut self) {
        self.connected = false;
    }

    /// Diagonal gradient that shifts one step per frame.
    fn generate_pixels(&self, seq: u64) -> Vec<u8> {
        let mut pixels = vec![0u8; (self.width * self.height * 3) as usize];
        let width = self.width as usize;
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = (i % width) as u64;
            let y = (i / width) as u64;
            let v = ((x + y + seq) % 256) as u8;
            px.copy_from_slice(&[v, v.wrapping_mul(3), 255 - v]);
        }
        pixels
    }
}

fn frame_period(fps: u32) -> Duration {
    if fps == 0 {
        Duration::from_millis(100)
    } else {
        Duration::from_secs_f64(1.0 / fps as f64)
    }
}

fn reader_uri(uri: &str) -> &str {
    uri.split('?').next().unwrap_or(uri)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
