use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::StreamError;
use crate::frame::Frame;
use crate::queue::{BoundedQueue, OverflowPolicy, PopOutcome, PushOutcome};

use super::{FrameReader, VideoSourceDescriptor};

/// Connection state of a stream source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Connected,
    Disconnected,
    /// Waiting before reconnect attempt `n` (1-based).
    Backoff(u32),
    /// Reconnect budget exhausted. Terminal.
    Failed,
    /// Closed by the owner. Terminal.
    Closed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Failed | StreamState::Closed)
    }
}

/// Counters for one stream source.
#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    pub frames_captured: u64,
    /// Frames evicted from the buffer before the consumer read them.
    pub frames_dropped: u64,
    pub reconnect_attempts: u64,
    pub last_error: Option<String>,
}

struct Shared {
    state: StreamState,
    stats: StreamStats,
    attempts_exhausted: Option<u32>,
}

/// Handle to one open video source.
///
/// Frames are decoded on a background thread into a bounded buffer of
/// `buffer_size` frames; when the consumer falls behind the oldest unread
/// frame is discarded.
pub struct StreamSource {
    descriptor: VideoSourceDescriptor,
    queue: Arc<BoundedQueue<Frame>>,
    shared: Arc<Mutex<Shared>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl StreamSource {
    /// Open the source and start the capture thread.
    ///
    /// Fails only when no reader can handle the descriptor; connection
    /// problems are handled by the reconnect state machine.
    pub fn open(descriptor: VideoSourceDescriptor) -> Result<Self, StreamError> {
        let reader = FrameReader::for_descriptor(&descriptor)?;
        let queue = Arc::new(BoundedQueue::new(
            descriptor.buffer_size,
            OverflowPolicy::DropOldest,
        ));
        let shared = Arc::new(Mutex::new(Shared {
            state: StreamState::Connecting,
            stats: StreamStats::default(),
            attempts_exhausted: None,
        }));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let capture = CaptureLoop {
                descriptor: descriptor.clone(),
                reader,
                queue: Arc::clone(&queue),
                shared: Arc::clone(&shared),
                shutdown: Arc::clone(&shutdown),
                seq: 0,
            };
            std::thread::Builder::new()
                .name(format!("capture-{}", descriptor.name))
                .spawn(move || capture.run())
                .map_err(|e| StreamError::Connect {
                    uri: descriptor.display_uri(),
                    reason: format!("spawn capture thread: {}", e),
                })?
        };

        Ok(Self {
            descriptor,
            queue,
            shared,
            shutdown,
            worker: Some(worker),
        })
    }

    pub fn descriptor(&self) -> &VideoSourceDescriptor {
        &self.descriptor
    }

    /// Next frame in arrival order.
    ///
    /// `Ok(None)` means nothing arrived within `timeout`. Buffered frames are
    /// still delivered after the source fails; then the terminal error is
    /// returned.
    pub fn next_frame(&self, timeout: Duration) -> Result<Option<Frame>, StreamError> {
        let outcome = self.queue.pop_timeout(timeout);
        self.resolve(outcome)
    }

    /// Newest buffered frame, discarding older unread ones.
    pub fn latest_frame(&self, timeout: Duration) -> Result<Option<Frame>, StreamError> {
        let outcome = self.queue.pop_latest(timeout);
        self.resolve(outcome)
    }

    fn resolve(&self, outcome: PopOutcome<Frame>) -> Result<Option<Frame>, StreamError> {
        match outcome {
            PopOutcome::Item(frame) => Ok(Some(frame)),
            PopOutcome::TimedOut => Ok(None),
            PopOutcome::Closed => match lock(&self.shared).attempts_exhausted {
                Some(attempts) => Err(StreamError::Failed {
                    uri: self.descriptor.display_uri(),
                    attempts,
                }),
                None => Err(StreamError::Closed),
            },
        }
    }

    pub fn state(&self) -> StreamState {
        lock(&self.shared).state
    }

    pub fn stats(&self) -> StreamStats {
        let mut stats = lock(&self.shared).stats.clone();
        stats.frames_dropped = self.queue.dropped();
        stats
    }

    /// Stop capture and release the connection. Idempotent.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("stream {}: capture thread panicked", self.descriptor.name);
            }
        }
        let mut shared = lock(&self.shared);
        if shared.state != StreamState::Failed {
            shared.state = StreamState::Closed;
        }
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

// ----------------------------------------------------------------------------
// Capture thread
// ----------------------------------------------------------------------------

struct CaptureLoop {
    descriptor: VideoSourceDescriptor,
    reader: FrameReader,
    queue: Arc<BoundedQueue<Frame>>,
    shared: Arc<Mutex<Shared>>,
    shutdown: Arc<AtomicBool>,
    seq: u64,
}

impl CaptureLoop {
    fn run(mut self) {
        let policy = self.descriptor.reconnect;
        let name = self.descriptor.name.clone();
        let uri = self.descriptor.display_uri();

        // Consecutive failed reconnects since the last good connection.
        let mut failures: u32 = 0;
        let mut first = true;

        loop {
            if self.stopping() {
                break;
            }
            if !first {
                if failures >= policy.max_attempts {
                    log::error!(
                        "stream {}: giving up on {} after {} reconnect attempts",
                        name,
                        uri,
                        failures
                    );
                    let mut shared = lock(&self.shared);
                    shared.state = StreamState::Failed;
                    shared.attempts_exhausted = Some(failures);
                    drop(shared);
                    self.queue.close();
                    return;
                }
                failures += 1;
                self.set_state(StreamState::Backoff(failures));
                lock(&self.shared).stats.reconnect_attempts += 1;
                log::warn!(
                    "stream {}: reconnect {}/{} in {:?}",
                    name,
                    failures,
                    policy.max_attempts,
                    policy.delay
                );
                if !self.sleep_unless_stopped(policy.delay) {
                    break;
                }
            }
            first = false;

            self.set_state(StreamState::Connecting);
            match self.reader.connect(policy.timeout) {
                Ok(()) => {
                    failures = 0;
                    self.set_state(StreamState::Connected);
                    if !self.pump() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("stream {}: {}", name, e);
                    self.record_error(&e);
                }
            }
            self.set_state(StreamState::Disconnected);
        }

        self.reader.disconnect();
        self.set_state(StreamState::Closed);
    }

    /// Read until the connection drops. Returns false on shutdown.
    fn pump(&mut self) -> bool {
        loop {
            if self.stopping() {
                self.reader.disconnect();
                return false;
            }
            match self.reader.read(self.seq + 1) {
                Ok(Some(frame)) => {
                    self.seq += 1;
                    lock(&self.shared).stats.frames_captured += 1;
                    match self.queue.push(frame) {
                        PushOutcome::Evicted(old) => log::debug!(
                            "stream {}: buffer full, dropped frame {}",
                            self.descriptor.name,
                            old.seq
                        ),
                        PushOutcome::Closed(_) => return false,
                        _ => {}
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("stream {}: connection lost: {}", self.descriptor.name, e);
                    self.record_error(&e);
                    self.reader.disconnect();
                    return true;
                }
            }
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: StreamState) {
        lock(&self.shared).state = state;
    }

    fn record_error(&self, error: &StreamError) {
        lock(&self.shared).stats.last_error = Some(error.to_string());
    }

    fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ReconnectPolicy;

    fn descriptor(uri: &str, max_attempts: u32) -> VideoSourceDescriptor {
        let mut d = VideoSourceDescriptor::new(uri);
        d.reconnect = ReconnectPolicy {
            delay: Duration::from_millis(5),
            max_attempts,
            timeout: Duration::from_millis(200),
        };
        d
    }

    fn wait_for(source: &StreamSource, state: StreamState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if source.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn frames_arrive_in_order() {
        let source = StreamSource::open(descriptor("stub://cam?fps=200", 3)).unwrap();
        let a = source.next_frame(Duration::from_secs(2)).unwrap().unwrap();
        let b = source.next_frame(Duration::from_secs(2)).unwrap().unwrap();
        assert!(b.seq > a.seq);
    }

    #[test]
    fn reconnects_after_drop() {
        let source =
            StreamSource::open(descriptor("stub://cam?fps=500&drop_after=3", 3)).unwrap();
        let mut seen = 0;
        while seen < 8 {
            if source.next_frame(Duration::from_secs(2)).unwrap().is_some() {
                seen += 1;
            }
        }
        assert!(source.stats().reconnect_attempts >= 2);
        assert_ne!(source.state(), StreamState::Failed);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let source = StreamSource::open(descriptor("stub://cam?unreachable=true", 3)).unwrap();
        assert!(wait_for(&source, StreamState::Failed));
        assert_eq!(source.stats().reconnect_attempts, 3);
        match source.next_frame(Duration::from_millis(50)) {
            Err(StreamError::Failed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Failed, got {:?}", other.map(|f| f.map(|f| f.seq))),
        }
    }

    #[test]
    fn zero_attempts_fails_on_first_loss() {
        let source = StreamSource::open(descriptor("stub://cam?unreachable=true", 0)).unwrap();
        assert!(wait_for(&source, StreamState::Failed));
        assert_eq!(source.stats().reconnect_attempts, 0);
    }

    #[test]
    fn slow_consumer_drops_oldest() {
        let mut d = descriptor("stub://cam?fps=1000", 3);
        d.buffer_size = 2;
        let source = StreamSource::open(d).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(source.stats().frames_dropped > 0);
        let frame = source.next_frame(Duration::from_secs(1)).unwrap().unwrap();
        assert!(frame.seq > 2);
    }

    #[test]
    fn close_is_terminal() {
        let mut source = StreamSource::open(descriptor("stub://cam", 3)).unwrap();
        source.close();
        assert_eq!(source.state(), StreamState::Closed);
        assert!(matches!(
            source.next_frame(Duration::from_millis(10)),
            Err(StreamError::Closed) | Ok(Some(_))
        ));
        source.close();
    }
}
