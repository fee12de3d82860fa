use serde::Serialize;

use crate::alert::Alert;
use crate::frame::BoundingBox;

/// Wire form of an alert, shared by every channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertPayload {
    pub alert_id: String,
    pub task_id: String,
    pub task_name: String,
    pub video_name: String,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub image_url: Option<String>,
    pub title: String,
    pub message: String,
}

impl AlertPayload {
    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            alert_id: alert.id.clone(),
            task_id: alert.task_id.clone(),
            task_name: alert.task_name.clone(),
            video_name: alert.source_name.clone(),
            class_name: alert.class.clone(),
            confidence: alert.confidence,
            bbox: alert.bbox,
            timestamp: alert.timestamp.to_rfc3339(),
            image_url: alert.image_ref.clone(),
            title: alert.title.clone(),
            message: alert.message.clone(),
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Flat key/value form for query strings.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("alert_id", self.alert_id.clone()),
            ("task_id", self.task_id.clone()),
            ("task_name", self.task_name.clone()),
            ("video_name", self.video_name.clone()),
            ("class_name", self.class_name.clone()),
            ("confidence", format!("{:.4}", self.confidence)),
            ("timestamp", self.timestamp.clone()),
            ("title", self.title.clone()),
            ("message", self.message.clone()),
        ];
        if let Some(url) = &self.image_url {
            pairs.push(("image_url", url.clone()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn alert() -> Alert {
        Alert {
            id: "0123456789abcdef".into(),
            task_id: "gate".into(),
            task_name: "Gate".into(),
            source_name: "cam1".into(),
            class: "car".into(),
            confidence: 0.5,
            bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            image_ref: None,
            title: "car detected - Gate".into(),
            message: "hello".into(),
        }
    }

    #[test]
    fn json_carries_alert_fields() {
        let payload = AlertPayload::from_alert(&alert());
        let value: serde_json::Value = serde_json::from_slice(&payload.to_json()).unwrap();
        assert_eq!(value["task_id"], "gate");
        assert_eq!(value["class_name"], "car");
        assert_eq!(value["confidence"], 0.5);
        assert_eq!(value["timestamp"], "2023-11-14T22:13:20+00:00");
        assert!(value["image_url"].is_null());
    }

    #[test]
    fn query_pairs_skip_missing_image() {
        let payload = AlertPayload::from_alert(&alert());
        let pairs = payload.query_pairs();
        assert!(pairs.iter().all(|(k, _)| *k != "image_url"));
        assert!(pairs.contains(&("confidence", "0.5000".to_string())));
    }
}
