use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Outcome of offering a detection to the debouncer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Emit,
    Suppress,
}

#[derive(Clone, Debug)]
struct DebounceState {
    last_alert_at: DateTime<Utc>,
    suppressed: u64,
}

/// Leading-edge alert debouncer for one task.
///
/// The first detection of a class alerts immediately; later detections of
/// that class alert again only once `interval` has passed since the last
/// alert. Suppressed detections are counted, never reported. State is
/// keyed by class and owned by the task, so tasks never share it.
#[derive(Debug)]
pub struct Debouncer {
    task_id: String,
    interval: Duration,
    state: HashMap<String, DebounceState>,
}

impl Debouncer {
    pub fn new(task_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            task_id: task_id.into(),
            interval,
            state: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn check(&mut self, class: &str, now: DateTime<Utc>) -> Decision {
        match self.state.get_mut(class) {
            None => {
                self.state.insert(
                    class.to_string(),
                    DebounceState {
                        last_alert_at: now,
                        suppressed: 0,
                    },
                );
                Decision::Emit
            }
            Some(state) => {
                // A clock step backwards yields a negative delta: suppress.
                let elapsed = (now - state.last_alert_at).to_std().ok();
                if elapsed.is_some_and(|e| e >= self.interval) {
                    state.last_alert_at = now;
                    state.suppressed = 0;
                    Decision::Emit
                } else {
                    state.suppressed += 1;
                    log::debug!(
                        "task {}: {} suppressed ({} in window)",
                        self.task_id,
                        class,
                        state.suppressed
                    );
                    Decision::Suppress
                }
            }
        }
    }

    /// Detections suppressed since the last alert for `class`.
    pub fn suppressed(&self, class: &str) -> u64 {
        self.state.get(class).map(|s| s.suppressed).unwrap_or(0)
    }

    pub fn last_alert_at(&self, class: &str) -> Option<DateTime<Utc>> {
        self.state.get(class).map(|s| s.last_alert_at)
    }
}
