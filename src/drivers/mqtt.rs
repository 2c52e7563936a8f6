use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{DataKind, DeviceConfig, TagConfig};
use crate::error::GatewayError;
use crate::snapshot::Value;

use super::traits::{ProtocolDriver, WriteOutcome};

/// MQTT adapter (§4.1). Addresses are topic strings. Unlike the polled
/// protocols, `read` never touches the network — a background task drains
/// the `rumqttc` event loop and records each message against its topic;
/// `read` just serves the most recent cached value per tag
/// (`original_source/driver/mqtt_driver_process.py::_process_message`).
pub struct MqttDriver {
    config: DeviceConfig,
    client: Option<AsyncClient>,
    /// Cached by topic. `GatewayError` deliberately doesn't derive `Clone`
    /// (see `sql.rs`'s `clone_like` helper), so a coercion failure is kept
    /// as its rendered message and rewrapped as `Protocol` on read.
    cache: Arc<DashMap<String, Result<Value, String>>>,
    connected: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl MqttDriver {
    pub fn new(config: DeviceConfig) -> Self {
        MqttDriver {
            config,
            client: None,
            cache: Arc::new(DashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    /// Trim-and-parse coercion (§4.1): empty payload is null/bad, digits
    /// parse as int, otherwise a locale-tolerant float, else the raw string.
    fn coerce_payload(payload: &str) -> Result<Value, GatewayError> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::Protocol("empty payload received".into()));
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Ok(Value::Int(i));
        }
        if let Ok(f) = trimmed.replace(',', ".").parse::<f64>() {
            return Ok(Value::Float(f));
        }
        Ok(Value::String(trimmed.to_string()))
    }
}

#[async_trait]
impl ProtocolDriver for MqttDriver {
    async fn open(&mut self, timeout: Duration) -> Result<(), GatewayError> {
        let (host, port) = self
            .config
            .endpoint
            .split_once(':')
            .ok_or_else(|| GatewayError::Configuration(format!("bad broker address {}", self.config.endpoint)))?;
        let port: u16 = port
            .parse()
            .map_err(|e| GatewayError::Configuration(format!("bad broker port {port}: {e}")))?;

        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("scadagate-{}", self.config.id));

        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }

        debug!(device = %self.config.id, endpoint = %self.config.endpoint, "opening mqtt session");

        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        let cache = self.cache.clone();
        let connected = self.connected.clone();
        let device_id = self.config.id.clone();

        // First connect acknowledgement is awaited with a timeout so `open`
        // reports the same connect-failure semantics as the polled drivers.
        let first_ack = tokio::time::timeout(timeout, eventloop.poll()).await;
        match first_ack {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                connected.store(true, Ordering::SeqCst);
            }
            Ok(Ok(_)) => {
                connected.store(true, Ordering::SeqCst);
            }
            Ok(Err(e)) => return Err(GatewayError::Transport(format!("broker connect failed: {e}"))),
            Err(_) => return Err(GatewayError::Transport("broker connect timed out".into())),
        }

        self.pump = Some(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        let payload = String::from_utf8_lossy(&publish.payload).to_string();
                        cache.insert(topic, Self::coerce_payload(&payload).map_err(|e| e.to_string()));
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(device = %device_id, error = %e, "mqtt event loop error");
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }));

        self.client = Some(client);
        Ok(())
    }

    async fn read(&mut self, tags: &[TagConfig]) -> Vec<Result<Value, GatewayError>> {
        if !self.connected.load(Ordering::SeqCst) {
            return tags
                .iter()
                .map(|_| Err(GatewayError::Transport("not connected".into())))
                .collect();
        }

        // Subscribe lazily on first read of each topic; the connect-time
        // subscribe list is derived from the worker's scan-enabled tag set,
        // which the driver does not otherwise see.
        if let Some(client) = &self.client {
            for tag in tags {
                if !self.cache.contains_key(&tag.address) {
                    if let Err(e) = client.subscribe(&tag.address, QoS::AtLeastOnce).await {
                        error!(device = %self.config.id, topic = %tag.address, error = %e, "mqtt subscribe failed");
                    }
                }
            }
        }

        tags.iter()
            .map(|tag| match self.cache.get(&tag.address) {
                Some(entry) => entry.value().clone().map_err(GatewayError::Protocol),
                None => Err(GatewayError::Protocol(format!(
                    "no message received yet on {}",
                    tag.address
                ))),
            })
            .collect()
    }

    async fn write(
        &mut self,
        address: &str,
        value: Value,
        _kind: DataKind,
    ) -> Result<WriteOutcome, GatewayError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| GatewayError::Transport("not connected".into()))?;

        let payload = match value {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s,
        };

        client
            .publish(address, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| GatewayError::Transport(format!("publish failed: {e}")))?;

        Ok(WriteOutcome::unconfirmed())
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
