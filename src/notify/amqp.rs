#![cfg(feature = "notify-amqp")]

use amiquip::{
    AmqpProperties, Channel, Connection, ExchangeDeclareOptions, ExchangeType, Publish,
};

use crate::error::NotificationError;

use super::{AlertPayload, NotificationChannel, Notifier, DEFAULT_EXCHANGE, DEFAULT_ROUTING_KEY};

/// Persistent delivery; the broker writes the message to disk.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// RabbitMQ publisher on a durable topic exchange. The connection is made
/// on first send and re-made after any failure.
pub struct AmqpNotifier {
    name: String,
    url: String,
    exchange: String,
    routing_key: String,
    session: Option<(Connection, Channel)>,
}

impl AmqpNotifier {
    pub fn new(channel: &NotificationChannel) -> Result<Self, NotificationError> {
        let url = channel.endpoint.trim();
        if !url.starts_with("amqp://") {
            return Err(NotificationError::Config {
                channel: channel.name.clone(),
                reason: format!("expected amqp:// url, got {}", crate::ingest::mask_uri(url)),
            });
        }
        Ok(Self {
            name: channel.name.clone(),
            url: url.to_string(),
            exchange: channel
                .exchange
                .clone()
                .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            routing_key: channel
                .topic
                .clone()
                .unwrap_or_else(|| DEFAULT_ROUTING_KEY.to_string()),
            session: None,
        })
    }

    fn transport_err(&self, e: amiquip::Error) -> NotificationError {
        NotificationError::Transport {
            channel: self.name.clone(),
            reason: e.to_string(),
        }
    }

    fn publish(&mut self, body: &[u8]) -> Result<(), amiquip::Error> {
        if self.session.is_none() {
            let mut connection = Connection::insecure_open(&self.url)?;
            let channel = connection.open_channel(None)?;
            log::info!("notify: amqp channel {} connected", self.name);
            self.session = Some((connection, channel));
        }
        let Some((_, channel)) = self.session.as_ref() else {
            return Ok(());
        };
        let exchange = channel.exchange_declare(
            ExchangeType::Topic,
            self.exchange.as_str(),
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
        )?;
        exchange.publish(Publish::with_properties(
            body,
            self.routing_key.as_str(),
            AmqpProperties::default()
                .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                .with_content_type("application/json".to_string()),
        ))
    }
}

impl Notifier for AmqpNotifier {
    fn send(&mut self, payload: &AlertPayload) -> Result<(), NotificationError> {
        let body = payload.to_json();
        self.publish(&body).map_err(|e| {
            if let Some((connection, _)) = self.session.take() {
                let _ = connection.close();
            }
            self.transport_err(e)
        })
    }
}
