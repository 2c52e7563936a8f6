use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::DeviceConfig;

/// Connection state of a driver worker (§3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Starting,
    Connected,
    Disconnected,
    Stopped,
}

/// Quality of a tag sample (§3, GLOSSARY). `good` only after a successful
/// read; `bad` on disconnect or read error; `uncertain` between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
}

/// A tag's observed value, typed loosely enough to carry any declared
/// `DataKind` without the snapshot needing to know which one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// One tag's current state within a driver runtime record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagSample {
    pub value: Option<Value>,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
    pub driver_id: String,
}

impl TagSample {
    pub fn bad(driver_id: impl Into<String>, detail: impl Into<String>) -> Self {
        TagSample {
            value: None,
            quality: Quality::Bad,
            timestamp: Utc::now(),
            detail: Some(detail.into()),
            driver_id: driver_id.into(),
        }
    }

    pub fn good(driver_id: impl Into<String>, value: Value) -> Self {
        TagSample {
            value: Some(value),
            quality: Quality::Good,
            timestamp: Utc::now(),
            detail: None,
            driver_id: driver_id.into(),
        }
    }
}

/// Driver runtime record: exactly one per configured device (§3).
///
/// Mutated only by the owning driver worker; every other reader sees a
/// coarse, atomically-replaced snapshot of it (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRecord {
    pub status: ConnectionState,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub config: DeviceConfig,
    pub tags: HashMap<String, TagSample>,
}

impl DriverRecord {
    pub fn starting(config: DeviceConfig) -> Self {
        DriverRecord {
            status: ConnectionState::Starting,
            detail: None,
            timestamp: Utc::now(),
            config,
            tags: HashMap::new(),
        }
    }

    /// Marks every tag currently tracked as bad, per the disconnect/stop
    /// invariant (§3: "every tag of that driver becomes bad within one scan
    /// interval").
    pub fn mark_all_bad(&mut self, detail: impl Into<String>) {
        let detail = detail.into();
        let driver_id = self.config.id.clone();
        for sample in self.tags.values_mut() {
            *sample = TagSample::bad(driver_id.clone(), detail.clone());
        }
        self.timestamp = Utc::now();
    }

    pub fn transition(&mut self, status: ConnectionState, detail: Option<String>) {
        self.status = status;
        self.detail = detail;
        self.timestamp = Utc::now();
    }

    /// Replaces the tag map wholesale, the only write path into a record's
    /// samples (§4.2 "Publishing").
    pub fn publish_scan(&mut self, tags: HashMap<String, TagSample>) {
        self.tags = tags;
        self.status = ConnectionState::Connected;
        self.timestamp = Utc::now();
    }
}

/// A command accepted through the write-routing fabric (§3, §4.4).
#[derive(Debug, Clone)]
pub enum WriteCommand {
    Single {
        tag_id: String,
        value: Value,
    },
    /// SQL-only (§4.1). `row_id`, when present, names an existing row by
    /// column and turns this into an `UPDATE` instead of an `INSERT`.
    SqlBatch {
        device_id: String,
        values: HashMap<String, Value>,
        row_id: Option<(String, Value)>,
    },
}
