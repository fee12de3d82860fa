#![cfg(feature = "notify-kafka")]

use std::time::Duration;

use kafka::producer::{Producer, Record, RequiredAcks};

use crate::error::NotificationError;

use super::{AlertPayload, NotificationChannel, Notifier, DEFAULT_KAFKA_TOPIC};

/// Kafka producer requiring the partition leader's ack. Connects lazily.
pub struct KafkaNotifier {
    name: String,
    hosts: Vec<String>,
    topic: String,
    timeout: Duration,
    producer: Option<Producer>,
}

impl KafkaNotifier {
    pub fn new(channel: &NotificationChannel) -> Result<Self, NotificationError> {
        let hosts: Vec<String> = channel
            .endpoint
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            return Err(NotificationError::Config {
                channel: channel.name.clone(),
                reason: "no bootstrap servers".into(),
            });
        }
        Ok(Self {
            name: channel.name.clone(),
            hosts,
            topic: channel
                .topic
                .clone()
                .unwrap_or_else(|| DEFAULT_KAFKA_TOPIC.to_string()),
            timeout: channel.timeout,
            producer: None,
        })
    }

    fn transport_err(&self, e: kafka::Error) -> NotificationError {
        NotificationError::Transport {
            channel: self.name.clone(),
            reason: e.to_string(),
        }
    }
}

impl Notifier for KafkaNotifier {
    fn send(&mut self, payload: &AlertPayload) -> Result<(), NotificationError> {
        if self.producer.is_none() {
            let producer = Producer::from_hosts(self.hosts.clone())
                .with_ack_timeout(self.timeout)
                .with_required_acks(RequiredAcks::One)
                .create()
                .map_err(|e| self.transport_err(e))?;
            log::info!("notify: kafka channel {} connected", self.name);
            self.producer = Some(producer);
        }
        let body = payload.to_json();
        let result = match self.producer.as_mut() {
            Some(producer) => {
                producer.send(&Record::from_value(self.topic.as_str(), body.as_slice()))
            }
            None => return Ok(()),
        };
        result.map_err(|e| {
            self.producer = None;
            self.transport_err(e)
        })
    }
}
