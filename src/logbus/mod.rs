use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log severity (§3, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Success,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Success => "success",
        }
    }
}

/// One structured log record (§3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Ring buffer of the most recent log records plus a best-effort daily
/// file tee (§4.8), grounded on `original_source/modulos/logger.py`'s
/// `deque(maxlen=MAX_LOGS)` + pipe-delimited file, expressed as a
/// `tracing`-independent bus the HTTP surface and the console both read
/// (console/file rendering is layered on top by `init_tracing`).
///
/// All operations are safe under concurrent producers: a single `Mutex`
/// guards the ring, matching the original's `log_lock`. Cheap to `Clone`
/// (an `Arc` of the shared inner state), the same sharing pattern as
/// `Snapshot`, so every worker and the fan-out can hold their own handle.
#[derive(Clone)]
pub struct LogBus {
    inner: Arc<Inner>,
}

struct Inner {
    capacity: usize,
    ring: Mutex<VecDeque<LogRecord>>,
    file_path: Option<PathBuf>,
}

impl LogBus {
    pub fn new(capacity: usize) -> Self {
        LogBus {
            inner: Arc::new(Inner {
                capacity,
                ring: Mutex::new(VecDeque::with_capacity(capacity)),
                file_path: None,
            }),
        }
    }

    /// Attaches a file tee under `dir`, named `inlogic_<YYYYMMDD_HHMMSS>.log`
    /// per §6. Creation failures are non-fatal — only the ring buffer is
    /// required to function.
    pub fn with_file_tee(self, dir: &std::path::Path) -> Self {
        if std::fs::create_dir_all(dir).is_err() {
            return self;
        }
        let name = format!("inlogic_{}.log", Utc::now().format("%Y%m%d_%H%M%S"));
        LogBus {
            inner: Arc::new(Inner {
                capacity: self.inner.capacity,
                ring: Mutex::new(VecDeque::with_capacity(self.inner.capacity)),
                file_path: Some(dir.join(name)),
            }),
        }
    }

    /// Appends one record: pushes to the ring (evicting the oldest when
    /// full) and best-effort appends a plain pipe-delimited line to the
    /// file tee.
    pub fn log(&self, level: LogLevel, source: impl Into<String>, message: impl Into<String>, details: Option<serde_json::Value>) {
        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
            details,
        };

        {
            let mut ring = self.inner.ring.lock().unwrap();
            if ring.len() >= self.inner.capacity {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        if let Some(path) = &self.inner.file_path {
            let mut line = format!(
                "{}|{}|{}|{}",
                record.timestamp.to_rfc3339(),
                record.level.as_str(),
                record.source,
                record.message
            );
            if let Some(details) = &record.details {
                line.push('|');
                line.push_str(&details.to_string());
            }
            line.push('\n');

            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = file.write_all(line.as_bytes());
            }
        }
    }

    /// The `n` most recent records, oldest first, chronological order
    /// preserved (§8 invariant 5).
    pub fn recent(&self, n: usize) -> Vec<LogRecord> {
        let ring = self.inner.ring.lock().unwrap();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Records strictly after `since`.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<LogRecord> {
        let ring = self.inner.ring.lock().unwrap();
        ring.iter().filter(|r| r.timestamp > since).cloned().collect()
    }

    /// `recent`/`since` combined with an optional level filter, backing
    /// `GET /api/logs?limit=&since=&level=` (§4.7).
    pub fn query(&self, limit: Option<usize>, since: Option<DateTime<Utc>>, level: Option<LogLevel>) -> Vec<LogRecord> {
        let ring = self.inner.ring.lock().unwrap();
        let mut records: Vec<LogRecord> = ring
            .iter()
            .filter(|r| since.map(|s| r.timestamp > s).unwrap_or(true))
            .filter(|r| level.map(|lv| r.level == lv).unwrap_or(true))
            .cloned()
            .collect();

        if let Some(limit) = limit {
            let skip = records.len().saturating_sub(limit);
            records = records.split_off(skip);
        }
        records
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new(5000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_preserves_chronological_order_and_caps_at_n() {
        let bus = LogBus::new(5000);
        for i in 0..10 {
            bus.log(LogLevel::Info, "test", format!("message {i}"), None);
        }

        let last3 = bus.recent(3);
        assert_eq!(last3.len(), 3);
        assert_eq!(last3[0].message, "message 7");
        assert_eq!(last3[2].message, "message 9");
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let bus = LogBus::new(3);
        for i in 0..5 {
            bus.log(LogLevel::Info, "test", format!("message {i}"), None);
        }
        let all = bus.recent(100);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "message 2");
    }

    #[test]
    fn level_filter_narrows_query() {
        let bus = LogBus::new(100);
        bus.log(LogLevel::Info, "test", "info line", None);
        bus.log(LogLevel::Error, "test", "error line", None);
        let errors = bus.query(None, None, Some(LogLevel::Error));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "error line");
    }
}
