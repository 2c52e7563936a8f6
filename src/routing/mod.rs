use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::snapshot::{Value, WriteCommand};

/// Default bounded write-queue capacity per device (§4.4).
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Outcome of a policy-gate check (§4.6's `validate_write` contract).
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        PolicyDecision {
            allow: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        PolicyDecision {
            allow: false,
            reason: Some(reason.into()),
        }
    }
}

/// The policy gate a write passes through before being enqueued (§4.4,
/// §4.6). Implemented by the cognitive layer; a pass-through default is
/// used when no cognitive sink rejects writes.
pub trait WritePolicy: Send + Sync {
    fn validate_write(&self, tag_id: &str, value: &Value) -> PolicyDecision;
}

/// Allows every write — the default when no policy gate is configured.
pub struct AllowAllPolicy;

impl WritePolicy for AllowAllPolicy {
    fn validate_write(&self, _tag_id: &str, _value: &Value) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

/// One device's write queue: the MPSC sender half handed to HTTP callers,
/// the receiver half owned by that device's worker.
struct DeviceQueue {
    sender: mpsc::Sender<WriteCommand>,
}

/// Write-routing fabric (C4, §4.4): a tag-id → device-id index plus one
/// bounded, multi-producer/single-consumer write queue per device.
///
/// Built once at supervisor start from configuration and atomically
/// swapped wholesale on restart (§5); read-only between swaps.
pub struct Router {
    tag_to_device: HashMap<String, String>,
    writable_tags: HashMap<String, bool>,
    queues: DashMap<String, DeviceQueue>,
}

/// A device's write-queue receiver, handed once to its worker at spawn time.
pub struct DeviceWriteQueue {
    pub device_id: String,
    pub receiver: mpsc::Receiver<WriteCommand>,
}

impl Router {
    /// Builds the routing table and per-device queues from configuration
    /// (§4.4, §6). Returns the table plus the receiver halves the caller
    /// must hand to each device's worker.
    pub fn build(config: &GatewayConfig, queue_capacity: usize) -> (Arc<Router>, Vec<DeviceWriteQueue>) {
        let mut tag_to_device = HashMap::new();
        let mut writable_tags = HashMap::new();
        for tag in config.all_tags() {
            tag_to_device.insert(tag.id.clone(), tag.device_id.clone());
            writable_tags.insert(tag.id.clone(), tag.writable);
        }

        let queues = DashMap::new();
        let mut receivers = Vec::new();
        for device in config.all_devices() {
            let (tx, rx) = mpsc::channel(queue_capacity);
            queues.insert(device.id.clone(), DeviceQueue { sender: tx });
            receivers.push(DeviceWriteQueue {
                device_id: device.id.clone(),
                receiver: rx,
            });
        }

        (
            Arc::new(Router {
                tag_to_device,
                writable_tags,
                queues,
            }),
            receivers,
        )
    }

    /// Resolves a tag to its owning device id (§8 invariant 1).
    pub fn device_for_tag(&self, tag_id: &str) -> Option<&str> {
        self.tag_to_device.get(tag_id).map(String::as_str)
    }

    pub fn is_writable(&self, tag_id: &str) -> bool {
        self.writable_tags.get(tag_id).copied().unwrap_or(false)
    }

    /// Enqueues a single-tag write: resolves the device, checks
    /// `writable`, runs the policy gate, then places the command on the
    /// device's bounded queue (§4.4).
    pub async fn enqueue(
        &self,
        policy: &dyn WritePolicy,
        tag_id: &str,
        value: Value,
    ) -> Result<(), GatewayError> {
        let device_id = self
            .device_for_tag(tag_id)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown tag {tag_id}")))?
            .to_string();

        if !self.is_writable(tag_id) {
            return Err(GatewayError::Permission(format!("tag {tag_id} is not writable")));
        }

        let decision = policy.validate_write(tag_id, &value);
        if !decision.allow {
            return Err(GatewayError::Permission(
                decision.reason.unwrap_or_else(|| "policy rejected write".into()),
            ));
        }

        self.send(&device_id, WriteCommand::Single {
            tag_id: tag_id.to_string(),
            value,
        })
        .await
    }

    /// Enqueues a SQL batch write (§4.4: "bypass per-tag lookup but still
    /// pass through the policy gate for each contained column").
    pub async fn enqueue_batch(
        &self,
        policy: &dyn WritePolicy,
        device_id: &str,
        values: HashMap<String, Value>,
        row_id: Option<(String, Value)>,
    ) -> Result<(), GatewayError> {
        for (column, value) in &values {
            let decision = policy.validate_write(column, value);
            if !decision.allow {
                return Err(GatewayError::Permission(
                    decision.reason.unwrap_or_else(|| "policy rejected write".into()),
                ));
            }
        }

        self.send(device_id, WriteCommand::SqlBatch {
            device_id: device_id.to_string(),
            values,
            row_id,
        })
        .await
    }

    async fn send(&self, device_id: &str, command: WriteCommand) -> Result<(), GatewayError> {
        let queue = self
            .queues
            .get(device_id)
            .ok_or_else(|| GatewayError::Configuration(format!("unknown device {device_id}")))?;

        queue
            .sender
            .try_send(command)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    GatewayError::Resource("queue-full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    GatewayError::Internal("device worker is gone".into())
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataKind, DeviceConfig, ProjectConfig, Protocol, TagConfig};

    fn sample_config() -> GatewayConfig {
        GatewayConfig {
            projetos: vec![ProjectConfig {
                id: "p1".into(),
                drivers: vec![DeviceConfig {
                    id: "dev1".into(),
                    name: "Device 1".into(),
                    protocol: Protocol::ModbusTcp,
                    endpoint: "127.0.0.1:1502".into(),
                    scan_interval_ms: 1000,
                    connect_timeout_ms: 5000,
                    retry_count: 3,
                    log_enabled: true,
                    slave_id: None,
                    client_id: None,
                    username: None,
                    password: None,
                    table_name: None,
                    db_kind: None,
                }],
                tags: vec![
                    TagConfig {
                        id: "t1".into(),
                        device_id: "dev1".into(),
                        name: "Speed".into(),
                        address: "40001".into(),
                        data_kind: DataKind::Int,
                        scan_enabled: true,
                        writable: true,
                        display_field: None,
                    },
                    TagConfig {
                        id: "t2".into(),
                        device_id: "dev1".into(),
                        name: "ReadOnly".into(),
                        address: "40002".into(),
                        data_kind: DataKind::Int,
                        scan_enabled: true,
                        writable: false,
                        display_field: None,
                    },
                ],
            }],
        }
    }

    #[tokio::test]
    async fn routes_writable_tag_to_its_device() {
        let (router, mut queues) = Router::build(&sample_config(), 4);
        router
            .enqueue(&AllowAllPolicy, "t1", Value::Int(17))
            .await
            .unwrap();

        let queue = &mut queues[0];
        let cmd = queue.receiver.try_recv().unwrap();
        match cmd {
            WriteCommand::Single { tag_id, value } => {
                assert_eq!(tag_id, "t1");
                assert_eq!(value, Value::Int(17));
            }
            _ => panic!("expected single write"),
        }
    }

    #[tokio::test]
    async fn rejects_non_writable_tag() {
        let (router, _queues) = Router::build(&sample_config(), 4);
        let err = router
            .enqueue(&AllowAllPolicy, "t2", Value::Int(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission");
    }

    #[tokio::test]
    async fn rejects_unknown_tag() {
        let (router, _queues) = Router::build(&sample_config(), 4);
        let err = router
            .enqueue(&AllowAllPolicy, "unknown", Value::Int(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    struct RejectPolicy;
    impl WritePolicy for RejectPolicy {
        fn validate_write(&self, _tag_id: &str, _value: &Value) -> PolicyDecision {
            PolicyDecision::reject("phase-monitor")
        }
    }

    #[tokio::test]
    async fn policy_reject_blocks_enqueue() {
        let (router, mut queues) = Router::build(&sample_config(), 4);
        let err = router
            .enqueue(&RejectPolicy, "t1", Value::Int(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission");
        assert!(queues[0].receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn queue_full_yields_resource_error() {
        let (router, _queues) = Router::build(&sample_config(), 1);
        router
            .enqueue(&AllowAllPolicy, "t1", Value::Int(1))
            .await
            .unwrap();
        let err = router
            .enqueue(&AllowAllPolicy, "t1", Value::Int(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "resource");
    }
}
