//! Video ingestion.
//!
//! A `StreamSource` owns exactly one video connection. A dedicated capture
//! thread decodes frames into a bounded drop-oldest queue, so a slow runner
//! never stalls the decoder. On connection loss the thread walks the
//! reconnect state machine:
//!
//! `Connected -> Disconnected -> Backoff(n) -> Connecting -> Connected`
//!
//! with a fixed delay between attempts. Once `max_attempts` consecutive
//! reconnects fail the source becomes `Failed` and the runner sees a fatal
//! `StreamError::Failed`.
//!
//! Readers:
//! - `stub://` URIs: synthetic frames for tests and demos (always available)
//! - everything else: GStreamer (feature: rtsp-gstreamer)

#[cfg(feature = "rtsp-gstreamer")]
mod pipeline;
mod source;
mod synthetic;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::frame::Frame;

pub use source::{StreamSource, StreamState, StreamStats};

pub const DEFAULT_BUFFER_SIZE: usize = 10;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FPS: u32 = 10;

/// How the video reaches us.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Rtsp,
    Rtmp,
    Http,
    File,
    Usb,
}

impl TransportKind {
    /// Guess the transport from a URI scheme. Bare paths are files,
    /// `/dev/video*` is a USB camera.
    pub fn infer(uri: &str) -> Self {
        let lower = uri.trim().to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            TransportKind::Rtsp
        } else if lower.starts_with("rtmp://") || lower.starts_with("rtmps://") {
            TransportKind::Rtmp
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            TransportKind::Http
        } else if lower.starts_with("/dev/video") || lower.starts_with("usb://") {
            TransportKind::Usb
        } else {
            TransportKind::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Rtsp => "rtsp",
            TransportKind::Rtmp => "rtmp",
            TransportKind::Http => "http",
            TransportKind::File => "file",
            TransportKind::Usb => "usb",
        }
    }
}

/// Stream credentials. The password never appears in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Fixed-delay reconnect policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Consecutive failed reconnects before the source gives up.
    pub max_attempts: u32,
    /// Hard bound on a single connect attempt.
    pub timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Everything needed to open one video source.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoSourceDescriptor {
    /// Human-readable name, used in alert messages.
    pub name: String,
    pub transport: TransportKind,
    pub uri: String,
    pub credentials: Option<Credentials>,
    pub fps: u32,
    pub buffer_size: usize,
    pub reconnect: ReconnectPolicy,
}

impl VideoSourceDescriptor {
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            name: uri.clone(),
            transport: TransportKind::infer(&uri),
            uri,
            credentials: None,
            fps: DEFAULT_FPS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.uri.starts_with("stub://")
    }

    /// URI with any embedded password replaced, for log lines.
    pub fn display_uri(&self) -> String {
        mask_uri(&self.uri)
    }
}

/// Replace the password component of a URI with `***`.
pub fn mask_uri(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_ok() {
                parsed.to_string()
            } else {
                uri.to_string()
            }
        }
        _ => uri.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Reader dispatch
// ----------------------------------------------------------------------------

/// One underlying connection, driven by the capture thread.
///
/// `read` returns `Ok(None)` when no frame arrived within its own short wait;
/// an `Err` means the connection is gone and must be re-established.
pub(crate) enum FrameReader {
    Synthetic(synthetic::SyntheticReader),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(pipeline::GstreamerReader),
}

impl FrameReader {
    pub(crate) fn for_descriptor(descriptor: &VideoSourceDescriptor) -> Result<Self, StreamError> {
        if descriptor.is_synthetic() {
            return Ok(FrameReader::Synthetic(synthetic::SyntheticReader::new(
                descriptor,
            )?));
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(FrameReader::Gstreamer(pipeline::GstreamerReader::new(
                descriptor,
            )?))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(StreamError::Unsupported(format!(
                "{} sources require the rtsp-gstreamer feature ({})",
                descriptor.transport.as_str(),
                descriptor.display_uri()
            )))
        }
    }

    pub(crate) fn connect(&mut self, timeout: Duration) -> Result<(), StreamError> {
        match self {
            FrameReader::Synthetic(reader) => reader.connect(timeout),
            #[cfg(feature = "rtsp-gstreamer")]
            FrameReader::Gstreamer(reader) => reader.connect(timeout),
        }
    }

    pub(crate) fn read(&mut self, seq: u64) -> Result<Option<Frame>, StreamError> {
        match self {
            FrameReader::Synthetic(reader) => reader.read(seq),
            #[cfg(feature = "rtsp-gstreamer")]
            FrameReader::Gstreamer(reader) => reader.read(seq),
        }
    }

    pub(crate) fn disconnect(&mut self) {
        match self {
            FrameReader::Synthetic(reader) => reader.disconnect(),
            #[cfg(feature = "rtsp-gstreamer")]
            FrameReader::Gstreamer(reader) => reader.disconnect(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
