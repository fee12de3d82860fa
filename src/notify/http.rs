use std::time::Duration;

use crate::error::NotificationError;

use super::{mask_header, AlertPayload, NotificationChannel, Notifier};

const METHODS: [&str; 4] = ["GET", "POST", "PUT", "PATCH"];

/// Webhook delivery. GET sends the payload as query parameters, the other
/// methods as a JSON body. Any 2xx status counts as delivered.
pub struct HttpNotifier {
    name: String,
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    agent: ureq::Agent,
}

impl HttpNotifier {
    pub fn new(channel: &NotificationChannel) -> Result<Self, NotificationError> {
        let config_err = |reason: String| NotificationError::Config {
            channel: channel.name.clone(),
            reason,
        };
        let parsed = url::Url::parse(channel.endpoint.trim())
            .map_err(|e| config_err(format!("invalid url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(config_err(format!("unsupported scheme {}", parsed.scheme())));
        }
        let method = channel.method.trim().to_ascii_uppercase();
        if !METHODS.contains(&method.as_str()) {
            return Err(config_err(format!("unsupported method {}", method)));
        }
        let headers: Vec<(String, String)> = channel
            .headers
            .iter()
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        log::info!(
            "notify: http channel {} -> {} {} headers [{}]",
            channel.name,
            method,
            crate::ingest::mask_uri(parsed.as_str()),
            headers
                .iter()
                .map(|(k, v)| format!("{}: {}", k, mask_header(k, v)))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let agent = ureq::AgentBuilder::new().timeout(channel.timeout).build();
        Ok(Self {
            name: channel.name.clone(),
            url: parsed.to_string(),
            method,
            headers,
            timeout: channel.timeout,
            agent,
        })
    }
}

impl Notifier for HttpNotifier {
    fn send(&mut self, payload: &AlertPayload) -> Result<(), NotificationError> {
        let mut request = self.agent.request(&self.method, &self.url);
        for (k, v) in &self.headers {
            request = request.set(k, v);
        }
        let result = if self.method == "GET" {
            for (k, v) in payload.query_pairs() {
                request = request.query(k, &v);
            }
            request.call()
        } else {
            request
                .set("Content-Type", "application/json")
                .send_bytes(&payload.to_json())
        };
        match result {
            Ok(response) if (200..300).contains(&response.status()) => Ok(()),
            Ok(response) => Err(NotificationError::Rejected {
                channel: self.name.clone(),
                status: response.status(),
            }),
            Err(ureq::Error::Status(status, _)) => Err(NotificationError::Rejected {
                channel: self.name.clone(),
                status,
            }),
            Err(ureq::Error::Transport(t)) => {
                let reason = t.to_string();
                if reason.contains("timed out") {
                    Err(NotificationError::Timeout {
                        channel: self.name.clone(),
                        timeout: self.timeout,
                    })
                } else {
                    Err(NotificationError::Transport {
                        channel: self.name.clone(),
                        reason,
                    })
                }
            }
        }
    }
}
