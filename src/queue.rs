//! Bounded producer/consumer queue.
//!
//! Every handoff in the pipeline goes through one of these: capture thread to
//! runner, runner to notification workers, runner to overlay subscribers.
//! Nothing is ever buffered without a bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// What `push` does when the queue is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest unread item to make room.
    DropOldest,
    /// Refuse the new item.
    Reject,
}

/// Outcome of a push.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Queued,
    /// Queued after evicting this item.
    Evicted(T),
    /// Not queued; the item is handed back.
    Rejected(T),
    /// Queue is closed; the item is handed back.
    Closed(T),
}

/// Outcome of a pop.
#[derive(Debug, PartialEq, Eq)]
pub enum PopOutcome<T> {
    Item(T),
    TimedOut,
    /// Closed and fully drained.
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    room: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            room: Condvar::new(),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, item: T) -> PushOutcome<T> {
        let mut inner = self.lock();
        if inner.closed {
            return PushOutcome::Closed(item);
        }
        let outcome = if inner.items.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                OverflowPolicy::Reject => return PushOutcome::Rejected(item),
                OverflowPolicy::DropOldest => match inner.items.pop_front() {
                    Some(evicted) => PushOutcome::Evicted(evicted),
                    None => PushOutcome::Queued,
                },
            }
        } else {
            PushOutcome::Queued
        };
        inner.items.push_back(item);
        drop(inner);
        self.ready.notify_one();
        outcome
    }

    /// Wait up to `timeout` for room instead of applying the overflow
    /// policy. Still full at the deadline: `Rejected`.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> PushOutcome<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return PushOutcome::Closed(item);
            }
            if inner.items.len() < self.capacity {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return PushOutcome::Rejected(item);
            }
            let (guard, _) = self
                .room
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
        inner.items.push_back(item);
        drop(inner);
        self.ready.notify_one();
        PushOutcome::Queued
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.room.notify_one();
        }
        item
    }

    /// Block until an item arrives, the queue closes, or `timeout` elapses.
    ///
    /// Items queued before `close` are still delivered.
    pub fn pop_timeout(&self, timeout: Duration) -> PopOutcome<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.room.notify_one();
                return PopOutcome::Item(item);
            }
            if inner.closed {
                return PopOutcome::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return PopOutcome::TimedOut;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    /// Pop everything currently queued, keeping only the newest item.
    ///
    /// Older items count as dropped.
    pub fn pop_latest(&self, timeout: Duration) -> PopOutcome<T> {
        match self.pop_timeout(timeout) {
            PopOutcome::Item(first) => {
                let mut inner = self.lock();
                let skipped = inner.items.len() as u64;
                let newest = inner.items.drain(..).last();
                if skipped > 0 {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    self.room.notify_all();
                }
                PopOutcome::Item(newest.unwrap_or(first))
            }
            other => other,
        }
    }

    /// Wake all waiters. Later pushes are refused.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
        self.room.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted or rejected for lack of room.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
