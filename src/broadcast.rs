//! Live overlay feed: per-task push of frame plus detections to viewers.
//!
//! Publishing never waits on a subscriber. Each subscription has its own
//! bounded queue; a subscriber whose queue is full when a frame is published
//! is disconnected instead of slowing the task runner down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::frame::Frame;
use crate::postprocess::Detection;
use crate::queue::{BoundedQueue, OverflowPolicy, PopOutcome, PushOutcome};

pub const DEFAULT_SUBSCRIBER_DEPTH: usize = 4;

/// One overlay update.
#[derive(Clone, Debug)]
pub struct OverlayFrame {
    pub task_id: String,
    pub frame: Frame,
    pub detections: Vec<Detection>,
    pub timestamp: DateTime<Utc>,
}

/// JSON-friendly view of an overlay update: the frame is referenced by
/// sequence number, not embedded.
#[derive(Clone, Debug, Serialize)]
pub struct OverlayMessage<'a> {
    pub task_id: &'a str,
    pub frame_seq: u64,
    pub width: u32,
    pub height: u32,
    pub detections: &'a [Detection],
    pub timestamp: DateTime<Utc>,
}

impl OverlayFrame {
    pub fn message(&self) -> OverlayMessage<'_> {
        OverlayMessage {
            task_id: &self.task_id,
            frame_seq: self.frame.seq,
            width: self.frame.width,
            height: self.frame.height,
            detections: &self.detections,
            timestamp: self.timestamp,
        }
    }
}

struct Subscriber {
    id: u64,
    queue: Arc<BoundedQueue<Arc<OverlayFrame>>>,
}

/// Registry of overlay subscribers, keyed by task id.
pub struct OverlayHub {
    next_id: AtomicU64,
    depth: usize,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl OverlayHub {
    pub fn new(depth: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            depth: depth.max(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, task_id: &str) -> OverlaySubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(BoundedQueue::new(self.depth.max(1), OverflowPolicy::Reject));
        self.lock()
            .entry(task_id.to_string())
            .or_default()
            .push(Subscriber {
                id,
                queue: Arc::clone(&queue),
            });
        log::debug!("overlay: task {} subscriber {} attached", task_id, id);
        OverlaySubscription {
            id,
            task_id: task_id.to_string(),
            queue,
        }
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.lock().get(task_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Deliver to every live subscriber of the task; returns how many took it.
    pub fn publish(&self, update: OverlayFrame) -> usize {
        let task_id = update.task_id.clone();
        let update = Arc::new(update);
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(&task_id) else {
            return 0;
        };
        let mut delivered = 0;
        list.retain(|sub| match sub.queue.push(Arc::clone(&update)) {
            PushOutcome::Queued | PushOutcome::Evicted(_) => {
                delivered += 1;
                true
            }
            PushOutcome::Rejected(_) => {
                log::info!(
                    "overlay: task {} subscriber {} too slow, dropped",
                    task_id,
                    sub.id
                );
                sub.queue.close();
                false
            }
            PushOutcome::Closed(_) => false,
        });
        if list.is_empty() {
            subscribers.remove(&task_id);
        }
        delivered
    }

    /// Disconnect every subscriber of a task, e.g. when it stops.
    pub fn close_task(&self, task_id: &str) {
        if let Some(list) = self.lock().remove(task_id) {
            for sub in list {
                sub.queue.close();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for OverlayHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_DEPTH)
    }
}

/// Receiving end of an overlay feed. Dropping it unsubscribes lazily: the
/// hub forgets it on the next publish.
pub struct OverlaySubscription {
    id: u64,
    task_id: String,
    queue: Arc<BoundedQueue<Arc<OverlayFrame>>>,
}

impl OverlaySubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next update; `Ok(None)` on timeout, `Err(Disconnected)` once the hub
    /// has dropped this subscriber and its backlog is drained.
    pub fn recv(&self, timeout: Duration) -> Result<Option<Arc<OverlayFrame>>, Disconnected> {
        match self.queue.pop_timeout(timeout) {
            PopOutcome::Item(update) => Ok(Some(update)),
            PopOutcome::TimedOut => Ok(None),
            PopOutcome::Closed => Err(Disconnected),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for OverlaySubscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// The hub dropped this subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disconnected;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
