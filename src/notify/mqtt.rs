use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, ConnectionError, Event, MqttOptions};
use rumqttc::Transport;

use crate::error::NotificationError;

use super::{AlertPayload, NotificationChannel, Notifier};

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host:port`, `mqtt://`, `tcp://`, `mqtts://` or `ssl://` broker
/// addresses. Bracketed IPv6 hosts are accepted; the port defaults to 1883
/// (8883 with TLS).
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim().trim_end_matches('/');

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    let default_port = if use_tls { 8883 } else { 1883 };
    let (host, port) = split_host_port(remainder, default_port)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(p) => p
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), default_port)),
    }
}

/// QoS 1 publisher. A send succeeds only once the broker's PUBACK arrives.
pub struct MqttNotifier {
    name: String,
    topic: String,
    timeout: Duration,
    client: Client,
    acks: Receiver<u16>,
    stop: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttNotifier {
    /// Set up the client. The broker connection is made in the background,
    /// so an unreachable broker surfaces as failed sends, not here.
    pub fn connect(channel: &NotificationChannel) -> Result<Self, NotificationError> {
        let config_err = |reason: String| NotificationError::Config {
            channel: channel.name.clone(),
            reason,
        };
        let endpoint =
            parse_mqtt_endpoint(&channel.endpoint).map_err(|e| config_err(e.to_string()))?;
        let topic = channel
            .topic
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| config_err("mqtt channel needs a topic".into()))?;

        let client_id = format!("edgewatch-{}-{:08x}", channel.name, rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &channel.username {
            options.set_credentials(user, channel.password.clone().unwrap_or_default());
        }
        options.set_transport(if endpoint.use_tls {
            Transport::tls_with_default_config()
        } else {
            Transport::tcp()
        });

        let (client, mut connection) = Client::new(options, 10);
        let (ack_tx, acks) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let name = channel.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("mqtt-{}", channel.name))
            .spawn(move || {
                for event in connection.iter() {
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match event {
                        Ok(Event::Incoming(Packet::PubAck(ack))) => {
                            let _ = ack_tx.send(ack.pkid);
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("notify: mqtt channel {} connected", name);
                        }
                        Ok(_) => {}
                        Err(ConnectionError::RequestsDone) => break,
                        Err(e) => {
                            log::warn!("notify: mqtt channel {} connection error: {}", name, e);
                            std::thread::sleep(RECONNECT_PAUSE);
                        }
                    }
                }
            })
            .map_err(|e| config_err(format!("spawn mqtt event loop: {}", e)))?;

        log::info!(
            "notify: mqtt channel {} -> {}:{} topic {} (TLS: {}, auth: {})",
            channel.name,
            endpoint.host,
            endpoint.port,
            topic,
            endpoint.use_tls,
            channel.username.is_some()
        );
        Ok(Self {
            name: channel.name.clone(),
            topic,
            timeout: channel.timeout,
            client,
            acks,
            stop,
            connection_handle: Some(handle),
        })
    }
}

impl Notifier for MqttNotifier {
    fn send(&mut self, payload: &AlertPayload) -> Result<(), NotificationError> {
        // Acks left over from an earlier timed-out publish.
        while self.acks.try_recv().is_ok() {}

        self.client
            .try_publish(self.topic.clone(), QoS::AtLeastOnce, false, payload.to_json())
            .map_err(|e| NotificationError::Transport {
                channel: self.name.clone(),
                reason: e.to_string(),
            })?;

        match self.acks.recv_timeout(self.timeout) {
            Ok(_) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(NotificationError::Timeout {
                channel: self.name.clone(),
                timeout: self.timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(NotificationError::Transport {
                channel: self.name.clone(),
                reason: "event loop stopped".into(),
            }),
        }
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.client.try_disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
