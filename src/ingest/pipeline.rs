//! GStreamer-backed readers for real video sources.
//!
//! One pipeline per connection, rebuilt on every reconnect:
//! - RTSP: `rtspsrc ! decodebin`
//! - RTMP / HTTP / file: `uridecodebin`
//! - USB: `v4l2src ! decodebin`
//!
//! All of them end in `videoconvert ! video/x-raw,format=RGB ! appsink`.
//! A file reaching end-of-stream counts as a disconnect, so the capture loop
//! reopens it and the file plays in a loop.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use gstreamer::prelude::*;

use crate::error::StreamError;
use crate::frame::Frame;

use super::{Credentials, TransportKind, VideoSourceDescriptor};

const SINK: &str = "videoconvert ! video/x-raw,format=RGB ! \
                    appsink name=appsink sync=false max-buffers=1 drop=true";

pub(crate) struct GstreamerReader {
    transport: TransportKind,
    uri: String,
    display_uri: String,
    credentials: Option<Credentials>,
    fps: u32,
    session: Option<Session>,
}

struct Session {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    /// First sample, pulled while confirming the connection.
    pending: Option<gstreamer::Sample>,
}

impl GstreamerReader {
    pub(crate) fn new(descriptor: &VideoSourceDescriptor) -> Result<Self, StreamError> {
        gstreamer::init().map_err(|e| StreamError::Unsupported(format!("gstreamer init: {}", e)))?;
        Ok(Self {
            transport: descriptor.transport,
            uri: descriptor.uri.clone(),
            display_uri: descriptor.display_uri(),
            credentials: descriptor.credentials.clone(),
            fps: descriptor.fps,
            session: None,
        })
    }

    /// Build the pipeline, start it, and wait for the first decoded frame.
    pub(crate) fn connect(&mut self, timeout: Duration) -> Result<(), StreamError> {
        self.disconnect();
        let session = self.build_session().map_err(|e| StreamError::Connect {
            uri: self.display_uri.clone(),
            reason: format!("{:#}", e),
        })?;
        session
            .pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| StreamError::Connect {
                uri: self.display_uri.clone(),
                reason: format!("set pipeline to Playing: {}", e),
            })?;

        let mut session = session;
        let first = session
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64));
        if let Some(reason) = bus_failure(&session.pipeline) {
            let _ = session.pipeline.set_state(gstreamer::State::Null);
            return Err(StreamError::Connect {
                uri: self.display_uri.clone(),
                reason,
            });
        }
        match first {
            Some(sample) => {
                session.pending = Some(sample);
                self.session = Some(session);
                log::info!("stream {}: connected", self.display_uri);
                Ok(())
            }
            None => {
                let _ = session.pipeline.set_state(gstreamer::State::Null);
                Err(StreamError::Timeout {
                    uri: self.display_uri.clone(),
                    timeout,
                })
            }
        }
    }

    pub(crate) fn read(&mut self, seq: u64) -> Result<Option<Frame>, StreamError> {
        let wait = self.frame_timeout();
        let session = self.session.as_mut().ok_or_else(|| StreamError::Read {
            uri: self.display_uri.clone(),
            reason: "not connected".to_string(),
        })?;

        if let Some(reason) = bus_failure(&session.pipeline) {
            return Err(StreamError::Read {
                uri: self.display_uri.clone(),
                reason,
            });
        }

        let sample = match session.pending.take() {
            Some(sample) => sample,
            None => match session
                .appsink
                .try_pull_sample(gstreamer::ClockTime::from_mseconds(wait.as_millis() as u64))
            {
                Some(sample) => sample,
                None if session.appsink.is_eos() => {
                    return Err(StreamError::Read {
                        uri: self.display_uri.clone(),
                        reason: "end of stream".to_string(),
                    })
                }
                None => return Ok(None),
            },
        };

        let (pixels, width, height) =
            sample_to_pixels(&sample).map_err(|e| StreamError::Read {
                uri: self.display_uri.clone(),
                reason: format!("{:#}", e),
            })?;
        let frame = Frame::from_rgb(pixels, width, height, seq, Utc::now()).map_err(|e| {
            StreamError::Read {
                uri: self.display_uri.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Some(frame))
    }

    pub(crate) fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("stream {}: failed to stop pipeline: {}", self.display_uri, e);
            }
        }
    }

    fn build_session(&self) -> Result<Session> {
        let description = self.pipeline_description()?;
        let pipeline = gstreamer::parse::launch(&description)
            .context("build video pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("video pipeline is not a Pipeline"))?;

        if let (TransportKind::Rtsp, Some(creds)) = (self.transport, &self.credentials) {
            let src = pipeline
                .by_name("src")
                .context("rtspsrc element missing from pipeline")?;
            src.set_property("user-id", creds.username.as_str());
            if let Some(password) = &creds.password {
                src.set_property("user-pw", password.as_str());
            }
        }

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Session {
            pipeline,
            appsink,
            pending: None,
        })
    }

    fn pipeline_description(&self) -> Result<String> {
        let head = match self.transport {
            TransportKind::Rtsp => format!(
                "rtspsrc name=src location=\"{}\" latency=0 ! decodebin",
                self.uri
            ),
            TransportKind::Rtmp | TransportKind::Http => {
                format!("uridecodebin name=src uri=\"{}\"", self.uri)
            }
            TransportKind::File => {
                format!("uridecodebin name=src uri=\"{}\"", file_uri(&self.uri)?)
            }
            TransportKind::Usb => format!(
                "v4l2src name=src device=\"{}\" ! decodebin",
                usb_device(&self.uri)
            ),
        };
        Ok(format!("{} ! {}", head, SINK))
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.fps == 0 {
            500
        } else {
            (1000 / self.fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }
}

impl Drop for GstreamerReader {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn file_uri(path: &str) -> Result<String> {
    if path.starts_with("file://") {
        return Ok(path.to_string());
    }
    let absolute = std::fs::canonicalize(path)
        .with_context(|| format!("video file {} not found", path))?;
    url::Url::from_file_path(&absolute)
        .map(|u| u.to_string())
        .map_err(|_| anyhow!("cannot build file URI for {}", absolute.display()))
}

fn usb_device(uri: &str) -> String {
    let rest = uri.strip_prefix("usb://").unwrap_or(uri);
    if rest.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/video{}", rest)
    } else {
        rest.to_string()
    }
}

/// Drain the bus; report the first error or end-of-stream.
fn bus_failure(pipeline: &gstreamer::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let mut failure = None;
    while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
        use gstreamer::MessageView;
        match message.view() {
            MessageView::Error(err) => {
                failure.get_or_insert_with(|| {
                    format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )
                });
            }
            MessageView::Eos(..) => {
                failure.get_or_insert_with(|| "end of stream".to_string());
            }
            _ => {}
        }
    }
    failure
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("video sample missing buffer")?;
    let caps = sample.caps().context("video sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map video buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("video buffer shorter than frame")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("video buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_device_paths() {
        assert_eq!(usb_device("usb://0"), "/dev/video0");
        assert_eq!(usb_device("/dev/video2"), "/dev/video2");
    }
}
