//! Alerts: creation, debouncing, snapshots and persistence.

mod debounce;
mod snapshot;
mod store;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::frame::BoundingBox;
use crate::postprocess::Detection;

pub use debounce::{Debouncer, Decision};
pub use snapshot::{SnapshotStore, DEFAULT_IMAGE_QUALITY, DEFAULT_MAX_SAVED_IMAGES};
pub use store::{AlertSink, InMemoryAlertSink, SqliteAlertSink};

pub const DEFAULT_MESSAGE_TEMPLATE: &str =
    "{class_name} detected by {task_name} on {video_name} at {time} (confidence {confidence}%)";

/// One emitted alert. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub task_id: String,
    pub task_name: String,
    pub source_name: String,
    pub class: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub timestamp: DateTime<Utc>,
    pub image_ref: Option<String>,
    pub title: String,
    pub message: String,
}

/// Per-task fields stamped onto every alert the task emits.
#[derive(Clone, Debug)]
pub struct AlertContext {
    pub task_id: String,
    pub task_name: String,
    pub source_name: String,
    pub template: String,
}

impl Alert {
    pub fn new(context: &AlertContext, detection: &Detection, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: alert_id(&context.task_id, &detection.label, detection.confidence, timestamp),
            task_id: context.task_id.clone(),
            task_name: context.task_name.clone(),
            source_name: context.source_name.clone(),
            class: detection.label.clone(),
            confidence: detection.confidence,
            bbox: detection.bbox,
            timestamp,
            image_ref: None,
            title: format!("{} detected - {}", detection.label, context.task_name),
            message: render_message(context, &detection.label, detection.confidence, timestamp),
        }
    }
}

/// 16 hex characters; unique even for identical detections.
fn alert_id(task_id: &str, class: &str, confidence: f32, at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(class.as_bytes());
    hasher.update(confidence.to_le_bytes());
    hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(rand::random::<u64>().to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Substitute `{task_name}`, `{video_name}`, `{class_name}`, `{time}` and
/// `{confidence}` (percent, two decimals).
pub fn render_message(
    context: &AlertContext,
    class: &str,
    confidence: f32,
    at: DateTime<Utc>,
) -> String {
    context
        .template
        .replace("{task_name}", &context.task_name)
        .replace("{video_name}", &context.source_name)
        .replace("{class_name}", class)
        .replace(
            "{time}",
            &at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        )
        .replace("{confidence}", &format!("{:.2}", confidence * 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(template: &str) -> AlertContext {
        AlertContext {
            task_id: "t1".into(),
            task_name: "Front door".into(),
            source_name: "porch".into(),
            template: template.into(),
        }
    }

    fn detection() -> Detection {
        Detection {
            class_id: 0,
            label: "person".into(),
            confidence: 0.9234,
            bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
        }
    }

    #[test]
    fn alert_carries_title_and_message() {
        let alert = Alert::new(
            &context("{class_name} on {video_name} for {task_name}: {confidence}"),
            &detection(),
            Utc::now(),
        );
        assert_eq!(alert.title, "person detected - Front door");
        assert_eq!(alert.message, "person on porch for Front door: 92.34");
        assert_eq!(alert.id.len(), 16);
        assert!(alert.image_ref.is_none());
    }

    #[test]
    fn ids_differ_for_identical_detections() {
        let now = Utc::now();
        let a = Alert::new(&context(DEFAULT_MESSAGE_TEMPLATE), &detection(), now);
        let b = Alert::new(&context(DEFAULT_MESSAGE_TEMPLATE), &detection(), now);
        assert_ne!(a.id, b.id);
    }
}
