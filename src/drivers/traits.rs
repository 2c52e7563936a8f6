use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{DataKind, TagConfig};
use crate::error::{DriverResult, GatewayError};
use crate::snapshot::Value;

/// Outcome of a single-address write (§4.1). `confirmed` carries the
/// post-write read-back value for protocols that verify round-trip equality
/// (ControlLogix); other protocols leave it `None`.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub confirmed: Option<Value>,
}

impl WriteOutcome {
    pub fn unconfirmed() -> Self {
        WriteOutcome { confirmed: None }
    }

    pub fn confirmed(value: Value) -> Self {
        WriteOutcome {
            confirmed: Some(value),
        }
    }
}

/// The capability set every protocol family implements (§4.1). One
/// concrete type per family, selected at worker construction time by the
/// configured `protocol` — the factory-by-tag-string the design notes call
/// for instead of reflection or dynamic dispatch by name.
///
/// A driver instance owns its own session; there is no separate session
/// handle crossing the trait boundary, so cancellation and errors cannot
/// leak between driver instances.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Establishes a session, blocking up to `timeout`.
    async fn open(&mut self, timeout: Duration) -> DriverResult<()>;

    /// Reads every given tag, in order matching the input. Individual
    /// failures do not abort the batch — the caller owns applying
    /// `DriverResult` per tag to its own sample.
    async fn read(&mut self, tags: &[TagConfig]) -> Vec<DriverResult<Value>>;

    /// Single-address write, value coerced to `kind`.
    async fn write(&mut self, address: &str, value: Value, kind: DataKind) -> DriverResult<WriteOutcome>;

    /// Multi-column batch write (§4.1, SQL only): an `INSERT`, or an
    /// `UPDATE` when `row_id` names an existing row. Protocols other than
    /// SQL have no batch form and reject with `Permission`.
    async fn write_batch(
        &mut self,
        _values: HashMap<String, Value>,
        _row_id: Option<(String, Value)>,
    ) -> DriverResult<()> {
        Err(GatewayError::Permission(
            "batch write is only supported by the sql driver".into(),
        ))
    }

    /// Idempotent; always succeeds.
    async fn close(&mut self);

    /// Cheap liveness probe; does not perform I/O beyond what the protocol
    /// needs to answer immediately.
    fn alive(&self) -> bool;
}
