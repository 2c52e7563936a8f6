use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;
use crate::snapshot::{ConnectionState, TagSample, Value};

/// HTTP JSON shapes, kept separate from the in-memory `DriverRecord`/
/// `TagSample` types per spec.md §9's "hidden coupling" redesign flag —
/// the wire format can evolve without touching the snapshot's internal
/// representation.

/// `GET /api/dados` response: one entry per device (§4.7).
#[derive(Debug, Serialize)]
pub struct DriverDto {
    pub status: &'static str,
    pub detail: Option<String>,
    pub timestamp: String,
    pub config: DeviceConfig,
    pub tags: HashMap<String, TagSampleDto>,
}

#[derive(Debug, Serialize)]
pub struct TagSampleDto {
    pub value: Option<Value>,
    pub quality: &'static str,
    pub timestamp: String,
    pub detail: Option<String>,
}

impl From<&TagSample> for TagSampleDto {
    fn from(sample: &TagSample) -> Self {
        TagSampleDto {
            value: sample.value.clone(),
            quality: match sample.quality {
                crate::snapshot::Quality::Good => "good",
                crate::snapshot::Quality::Bad => "bad",
                crate::snapshot::Quality::Uncertain => "uncertain",
            },
            timestamp: sample.timestamp.to_rfc3339(),
            detail: sample.detail.clone(),
        }
    }
}

pub fn status_str(status: ConnectionState) -> &'static str {
    match status {
        ConnectionState::Starting => "starting",
        ConnectionState::Connected => "connected",
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Stopped => "stopped",
    }
}

/// `POST /api/escrever` request body (§4.7, §6).
#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub tag_id: String,
    pub valor: Value,
}

/// `POST /api/escrever` / `POST /api/escrever_lote` response body.
#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub sucesso: bool,
    pub mensagem: String,
}

impl WriteResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        WriteResponse {
            sucesso: true,
            mensagem: message.into(),
        }
    }
}

/// `POST /api/escrever_lote` request body (§4.7). `row_id`, when present,
/// names the column identifying an existing row and turns the write into
/// an `UPDATE` (§4.1).
#[derive(Debug, Deserialize)]
pub struct BatchWriteRequest {
    pub driver_id: String,
    pub valores: HashMap<String, Value>,
    #[serde(default)]
    pub row_id_column: Option<String>,
    #[serde(default)]
    pub row_id_value: Option<Value>,
}

/// `GET /api/health` response (§4.7).
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub uptime_seconds: u64,
    pub process_rss_mb: f64,
    pub process_cpu_percent: f64,
    pub system_cpu_percent: f64,
    pub drivers_total: usize,
    pub drivers_active: usize,
    pub drivers_disconnected: usize,
    pub tags_total: usize,
    pub tags_good: usize,
}

/// `GET /api/logs` query parameters (§4.7).
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
    pub since: Option<String>,
    pub level: Option<String>,
}

/// `POST /api/system/restart` response.
#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub sucesso: bool,
    pub mensagem: String,
}
