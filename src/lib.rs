//! Edgewatch: object detection on live video at the edge.
//!
//! Frames flow from a video source through an inference backend into
//! post-processing, where detections are thresholded, suppressed and
//! filtered by region. Surviving detections are debounced per class and
//! turned into alerts, which are persisted and fanned out to the configured
//! notification channels.
//!
//! # Module Structure
//!
//! - `ingest`: video sources with reconnect (RTSP/RTMP/HTTP/file/USB, `stub://`)
//! - `detect`: backend registry, shared model loading, CPU/GPU/NPU backends
//! - `postprocess`: thresholds, NMS, region filtering
//! - `alert`: debouncing, snapshots, alert persistence
//! - `notify`: MQTT, HTTP, RabbitMQ and Kafka delivery with retry
//! - `broadcast`: live detection overlay for subscribers
//! - `runner` / `scheduler`: per-task workers and schedule reconciliation
//! - `config`: file and environment configuration

pub mod alert;
pub mod broadcast;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod postprocess;
pub mod queue;
pub mod runner;
pub mod schedule;
pub mod scheduler;

pub use alert::{Alert, AlertSink, InMemoryAlertSink, SnapshotStore, SqliteAlertSink};
pub use broadcast::{OverlayFrame, OverlayHub, OverlaySubscription};
pub use config::EngineConfig;
pub use detect::{BackendDescriptor, BackendPool, BackendRegistry, HardwareKind, RuntimeLoader};
pub use error::{EngineError, InferenceError, ModelLoadError, NotificationError, StreamError};
pub use frame::{BoundingBox, Frame};
pub use ingest::{StreamSource, TransportKind, VideoSourceDescriptor};
pub use notify::{AlertPayload, ChannelKind, Dispatcher, NotificationChannel};
pub use postprocess::{Detection, Region};
pub use runner::{RunnerContext, RunnerSettings, TaskConfig, TaskSnapshot, TaskStatus};
pub use schedule::{Schedule, ScheduleType};
pub use scheduler::{Scheduler, TaskManager};
