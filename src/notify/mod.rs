//! Alert fan-out to notification channels.
//!
//! Every enabled channel gets its own worker thread and bounded queue, so a
//! slow or unreachable channel never delays the others. Each worker retries
//! per its channel's `RetryPolicy` and then drops the alert with a logged
//! failure. Delivery is at-least-once: a send that succeeded but was not
//! acknowledged is retried and may arrive twice.

#[cfg(feature = "notify-amqp")]
mod amqp;
mod http;
#[cfg(feature = "notify-kafka")]
mod kafka;
mod mqtt;
mod payload;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alert::Alert;
use crate::error::NotificationError;
use crate::queue::{BoundedQueue, OverflowPolicy, PopOutcome, PushOutcome};

pub use http::HttpNotifier;
pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttNotifier};
pub use payload::AlertPayload;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHANNEL_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_EXCHANGE: &str = "atlas_alerts";
pub const DEFAULT_ROUTING_KEY: &str = "vision.detection";
pub const DEFAULT_KAFKA_TOPIC: &str = "atlas_alerts";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Mqtt,
    Http,
    #[serde(alias = "amqp")]
    Rabbitmq,
    Kafka,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Mqtt => "mqtt",
            ChannelKind::Http => "http",
            ChannelKind::Rabbitmq => "rabbitmq",
            ChannelKind::Kafka => "kafka",
        }
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// One configured notification target.
///
/// `endpoint` is a broker address for MQTT (`mqtt://host:port`), a URL for
/// HTTP, an AMQP URL for RabbitMQ and a comma-separated bootstrap list for
/// Kafka. `topic` is the MQTT/Kafka topic or the RabbitMQ routing key.
#[derive(Clone, PartialEq)]
pub struct NotificationChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub endpoint: String,
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// HTTP only.
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// RabbitMQ only.
    pub exchange: Option<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub queue_depth: usize,
}

impl NotificationChannel {
    pub fn new(name: impl Into<String>, kind: ChannelKind, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            endpoint: endpoint.into(),
            topic: None,
            username: None,
            password: None,
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            exchange: None,
            timeout: DEFAULT_CHANNEL_TIMEOUT,
            retry: RetryPolicy::default(),
            queue_depth: DEFAULT_CHANNEL_QUEUE_DEPTH,
        }
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let headers: BTreeMap<&str, String> = self
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), mask_header(k, v)))
            .collect();
        f.debug_struct("NotificationChannel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("endpoint", &crate::ingest::mask_uri(&self.endpoint))
            .field("topic", &self.topic)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("method", &self.method)
            .field("headers", &headers)
            .field("exchange", &self.exchange)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Header value as it may appear in logs.
pub fn mask_header(name: &str, value: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if ["token", "auth", "key", "secret", "password"]
        .iter()
        .any(|s| lower.contains(s))
    {
        "***".to_string()
    } else {
        value.to_string()
    }
}

/// One delivery transport.
pub trait Notifier: Send {
    /// Deliver one alert. Must return within the channel's timeout.
    fn send(&mut self, payload: &AlertPayload) -> Result<(), NotificationError>;
}

/// Build the transport for a channel.
pub fn build_notifier(
    channel: &NotificationChannel,
) -> Result<Box<dyn Notifier>, NotificationError> {
    match channel.kind {
        ChannelKind::Http => Ok(Box::new(HttpNotifier::new(channel)?)),
        ChannelKind::Mqtt => Ok(Box::new(MqttNotifier::connect(channel)?)),
        #[cfg(feature = "notify-amqp")]
        ChannelKind::Rabbitmq => Ok(Box::new(amqp::AmqpNotifier::new(channel)?)),
        #[cfg(not(feature = "notify-amqp"))]
        ChannelKind::Rabbitmq => Err(NotificationError::FeatureDisabled {
            channel: channel.name.clone(),
            feature: "notify-amqp",
        }),
        #[cfg(feature = "notify-kafka")]
        ChannelKind::Kafka => Ok(Box::new(kafka::KafkaNotifier::new(channel)?)),
        #[cfg(not(feature = "notify-kafka"))]
        ChannelKind::Kafka => Err(NotificationError::FeatureDisabled {
            channel: channel.name.clone(),
            feature: "notify-kafka",
        }),
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// Delivery counters for one channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub name: String,
    pub delivered: u64,
    pub failed: u64,
    pub retries: u64,
    /// Alerts evicted from a full channel queue before delivery.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

struct ChannelWorker {
    name: String,
    queue: Arc<BoundedQueue<Arc<AlertPayload>>>,
    counters: Arc<Counters>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Fans alerts out to every enabled channel.
pub struct Dispatcher {
    workers: Vec<ChannelWorker>,
}

impl Dispatcher {
    /// Start workers for every enabled channel. Channels whose transport
    /// cannot be built are logged and skipped.
    pub fn from_channels(channels: &[NotificationChannel]) -> Self {
        let mut dispatcher = Self {
            workers: Vec::new(),
        };
        for channel in channels.iter().filter(|c| c.enabled) {
            match build_notifier(channel) {
                Ok(notifier) => {
                    dispatcher.add(&channel.name, notifier, channel.retry, channel.queue_depth)
                }
                Err(e) => log::error!("notify: channel {} disabled: {}", channel.name, e),
            }
        }
        dispatcher
    }

    pub fn empty() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    /// Start a worker for an already-built notifier.
    pub fn add(
        &mut self,
        name: &str,
        mut notifier: Box<dyn Notifier>,
        retry: RetryPolicy,
        queue_depth: usize,
    ) {
        let queue: Arc<BoundedQueue<Arc<AlertPayload>>> =
            Arc::new(BoundedQueue::new(queue_depth, OverflowPolicy::DropOldest));
        let counters = Arc::new(Counters::default());
        let worker_queue = Arc::clone(&queue);
        let worker_counters = Arc::clone(&counters);
        let worker_name = name.to_string();
        let spawned = thread::Builder::new()
            .name(format!("notify-{}", name))
            .spawn(move || {
                loop {
                    match worker_queue.pop_timeout(Duration::from_millis(500)) {
                        PopOutcome::Item(payload) => deliver(
                            &worker_name,
                            notifier.as_mut(),
                            &payload,
                            retry,
                            &worker_counters,
                        ),
                        PopOutcome::TimedOut => continue,
                        PopOutcome::Closed => break,
                    }
                }
                log::debug!("notify: channel {} worker stopped", worker_name);
            });
        match spawned {
            Ok(handle) => self.workers.push(ChannelWorker {
                name: name.to_string(),
                queue,
                counters,
                handle: Mutex::new(Some(handle)),
            }),
            Err(e) => log::error!("notify: failed to start worker for {}: {}", name, e),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue an alert on every channel. Never blocks on delivery.
    pub fn dispatch(&self, alert: &Alert) {
        let payload = Arc::new(AlertPayload::from_alert(alert));
        for worker in &self.workers {
            match worker.queue.push(Arc::clone(&payload)) {
                PushOutcome::Queued => {}
                PushOutcome::Evicted(old) => log::warn!(
                    "notify: channel {} backlog full, dropped alert {}",
                    worker.name,
                    old.alert_id
                ),
                PushOutcome::Rejected(_) | PushOutcome::Closed(_) => log::warn!(
                    "notify: channel {} not accepting alert {}",
                    worker.name,
                    payload.alert_id
                ),
            }
        }
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        self.workers
            .iter()
            .map(|w| ChannelStats {
                name: w.name.clone(),
                delivered: w.counters.delivered.load(Ordering::Relaxed),
                failed: w.counters.failed.load(Ordering::Relaxed),
                retries: w.counters.retries.load(Ordering::Relaxed),
                dropped: w.queue.dropped(),
            })
            .collect()
    }

    /// Stop accepting alerts, let workers drain their queues, and join them.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.queue.close();
        }
        for worker in &self.workers {
            let handle = worker
                .handle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    log::error!("notify: channel {} worker panicked", worker.name);
                }
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver(
    channel: &str,
    notifier: &mut dyn Notifier,
    payload: &AlertPayload,
    retry: RetryPolicy,
    counters: &Counters,
) {
    let attempts = retry.attempts.max(1);
    for attempt in 1..=attempts {
        match notifier.send(payload) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "notify: channel {} delivered alert {} (attempt {})",
                    channel,
                    payload.alert_id,
                    attempt
                );
                return;
            }
            Err(e) if attempt < attempts => {
                counters.retries.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "notify: channel {} attempt {}/{} failed: {}",
                    channel,
                    attempt,
                    attempts,
                    e
                );
                thread::sleep(retry.delay);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "notify: channel {} dropped alert {} after {} attempts: {}",
                    channel,
                    payload.alert_id,
                    attempts,
                    e
                );
            }
        }
    }
}

/// In-process channel that records payloads; optionally fails every send.
/// Used by tests and dry runs.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<AlertPayload>>>,
    attempts: Arc<AtomicU64>,
    fail: bool,
    delay: Duration,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Every send takes at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sent(&self) -> Vec<AlertPayload> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl Notifier for RecordingNotifier {
    fn send(&mut self, payload: &AlertPayload) -> Result<(), NotificationError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail {
            return Err(NotificationError::Transport {
                channel: "recording".into(),
                reason: "configured to fail".into(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.clone());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BoundingBox;
    use chrono::Utc;
    use std::time::Instant;

    fn alert(id: &str) -> Alert {
        Alert {
            id: id.into(),
            task_id: "t".into(),
            task_name: "T".into(),
            source_name: "cam".into(),
            class: "person".into(),
            confidence: 0.9,
            bbox: BoundingBox::default(),
            timestamp: Utc::now(),
            image_ref: None,
            title: "person detected - T".into(),
            message: String::new(),
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn failing_channel_does_not_block_healthy_one() {
        let good = RecordingNotifier::new();
        let bad = RecordingNotifier::failing().with_delay(Duration::from_millis(50));
        let mut dispatcher = Dispatcher::empty();
        dispatcher.add("http", Box::new(bad.clone()), fast_retry(), 8);
        dispatcher.add("mqtt", Box::new(good.clone()), fast_retry(), 8);

        dispatcher.dispatch(&alert("a1"));
        dispatcher.dispatch(&alert("a2"));
        assert!(wait_until(|| good.sent().len() == 2));

        dispatcher.shutdown();
        assert_eq!(bad.attempts(), 6);
        let stats = dispatcher.stats();
        assert_eq!(stats[0].failed, 2);
        assert_eq!(stats[0].retries, 4);
        assert_eq!(stats[1].delivered, 2);
    }

    #[test]
    fn shutdown_drains_queued_alerts() {
        let good = RecordingNotifier::new();
        let mut dispatcher = Dispatcher::empty();
        dispatcher.add("rec", Box::new(good.clone()), fast_retry(), 8);
        for i in 0..5 {
            dispatcher.dispatch(&alert(&format!("a{i}")));
        }
        dispatcher.shutdown();
        assert_eq!(good.sent().len(), 5);
    }

    #[test]
    fn disabled_and_unbuildable_channels_are_skipped() {
        let mut off = NotificationChannel::new("off", ChannelKind::Http, "http://127.0.0.1:9/");
        off.enabled = false;
        let broken = NotificationChannel::new("broken", ChannelKind::Http, "not a url");
        let dispatcher = Dispatcher::from_channels(&[off, broken]);
        assert_eq!(dispatcher.channel_count(), 0);
    }

    #[test]
    fn secret_headers_are_masked() {
        assert_eq!(mask_header("Authorization", "Bearer x"), "***");
        assert_eq!(mask_header("X-Api-Key", "k"), "***");
        assert_eq!(mask_header("Content-Type", "application/json"), "application/json");
    }

    #[test]
    fn channel_kind_accepts_amqp_alias() {
        let kind: ChannelKind = serde_json::from_str("\"amqp\"").unwrap();
        assert_eq!(kind, ChannelKind::Rabbitmq);
    }
}
