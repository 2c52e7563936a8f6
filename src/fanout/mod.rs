use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cognitive::{CognitiveSink, IngestKind};
use crate::logbus::LogBus;
use crate::snapshot::{ConnectionState, Snapshot, TagSample};

/// Default fan-out tick period (§4.5).
pub const DEFAULT_TICK: Duration = Duration::from_secs(2);
/// Default number of recent log records carried on each process event
/// (§4.5).
pub const DEFAULT_LOG_TAIL: usize = 20;

/// What the fan-out remembers about one driver, to diff the next tick
/// against (§4.5: "change detection is by equality against the last-
/// emitted value").
#[derive(Debug, Clone, PartialEq)]
struct LastDriver {
    status: ConnectionState,
    detail: Option<String>,
}

/// Ingestion fan-out (C5, §4.5): a single periodic task that diffs the
/// snapshot against a private "last seen" table and forwards per-tag,
/// per-driver, and per-process events to a `CognitiveSink`.
///
/// Grounded on `original_source/modulos/sistema.py`'s
/// `_thread_distribuicao_ia` / `_distribuir_dados_dos_drivers` /
/// `_distribuir_dados_de_saude_do_sistema`, translated from a polling
/// thread into a `tokio::spawn` periodic task.
pub struct FanOut {
    snapshot: Snapshot,
    sink: Arc<dyn CognitiveSink>,
    logs: LogBus,
    tick: Duration,
    log_tail: usize,
    last_drivers: HashMap<String, LastDriver>,
    last_tags: HashMap<String, TagSample>,
    system: System,
    pid: Pid,
}

impl FanOut {
    pub fn new(snapshot: Snapshot, sink: Arc<dyn CognitiveSink>, logs: LogBus) -> Self {
        FanOut {
            snapshot,
            sink,
            logs,
            tick: DEFAULT_TICK,
            log_tail: DEFAULT_LOG_TAIL,
            last_drivers: HashMap::new(),
            last_tags: HashMap::new(),
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Runs until `stop` fires, sleeping `tick` between passes.
    pub async fn run(mut self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                _ = stop.cancelled() => return,
            }
            self.tick_once();
        }
    }

    /// One diff-and-emit pass, exposed separately from `run` so tests can
    /// drive it deterministically without sleeping.
    pub fn tick_once(&mut self) {
        let mut changed_drivers = 0usize;
        let mut changed_tags = 0usize;

        for (device_id, record) in self.snapshot.all() {
            let current = LastDriver {
                status: record.status,
                detail: record.detail.clone(),
            };
            let changed = self
                .last_drivers
                .get(&device_id)
                .map(|prev| prev != &current)
                .unwrap_or(true);

            if changed {
                changed_drivers += 1;
                self.sink.ingest(
                    IngestKind::Driver,
                    &device_id,
                    &json!({
                        "status": status_str(current.status),
                        "detail": current.detail,
                        "device_id": device_id,
                    }),
                );
                self.last_drivers.insert(device_id.clone(), current);
            }

            for (tag_id, sample) in &record.tags {
                let changed = self
                    .last_tags
                    .get(tag_id)
                    .map(|prev| !samples_equal(prev, sample))
                    .unwrap_or(true);

                if changed {
                    changed_tags += 1;
                    self.sink.ingest(
                        IngestKind::Tag,
                        tag_id,
                        &json!({
                            "value": value_json(sample),
                            "quality": quality_str(sample.quality),
                            "timestamp": sample.timestamp.to_rfc3339(),
                            "detail": sample.detail,
                            "driver_id": sample.driver_id,
                        }),
                    );
                    self.last_tags.insert(tag_id.clone(), sample.clone());
                }
            }
        }

        self.system.refresh_process(self.pid);
        let (cpu_percent, rss_mb) = self
            .system
            .process(self.pid)
            .map(|p| (p.cpu_usage() as f64, p.memory() as f64 / (1024.0 * 1024.0)))
            .unwrap_or((0.0, 0.0));

        let recent_logs = self.logs.recent(self.log_tail);
        self.sink.ingest(
            IngestKind::Process,
            "process",
            &json!({
                "cpu_percent": cpu_percent,
                "rss_mb": rss_mb,
                "active_workers": self.last_drivers.len(),
                "recent_logs": serde_json::to_value(&recent_logs).unwrap_or_default(),
            }),
        );

        info!(
            changed_drivers,
            changed_tags, "fan-out tick"
        );
    }
}

fn status_str(status: ConnectionState) -> &'static str {
    match status {
        ConnectionState::Starting => "starting",
        ConnectionState::Connected => "connected",
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Stopped => "stopped",
    }
}

fn quality_str(quality: crate::snapshot::Quality) -> &'static str {
    match quality {
        crate::snapshot::Quality::Good => "good",
        crate::snapshot::Quality::Bad => "bad",
        crate::snapshot::Quality::Uncertain => "uncertain",
    }
}

fn value_json(sample: &TagSample) -> serde_json::Value {
    match &sample.value {
        None => serde_json::Value::Null,
        Some(crate::snapshot::Value::Bool(b)) => json!(b),
        Some(crate::snapshot::Value::Int(i)) => json!(i),
        Some(crate::snapshot::Value::Float(f)) => json!(f),
        Some(crate::snapshot::Value::String(s)) => json!(s),
    }
}

fn samples_equal(a: &TagSample, b: &TagSample) -> bool {
    a.value == b.value && a.quality == b.quality && a.detail == b.detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::cognitive::NullCognitiveSink;
    use crate::config::Protocol;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<(IngestKind, String)>>,
        ingest_count: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink {
                events: Mutex::new(Vec::new()),
                ingest_count: AtomicUsize::new(0),
            }
        }
    }

    impl crate::routing::WritePolicy for RecordingSink {
        fn validate_write(&self, _tag_id: &str, _value: &crate::snapshot::Value) -> crate::routing::PolicyDecision {
            crate::routing::PolicyDecision::allow()
        }
    }

    impl CognitiveSink for RecordingSink {
        fn ingest(&self, kind: IngestKind, target_id: &str, _payload: &serde_json::Value) {
            self.ingest_count.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push((kind, target_id.to_string()));
        }
    }

    fn device_config() -> DeviceConfig {
        DeviceConfig {
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
        }
    }

    #[test]
    fn emits_driver_event_on_first_sight_then_suppresses_unchanged() {
        let snapshot = Snapshot::new();
        snapshot.register_device(device_config());
        let sink = Arc::new(RecordingSink::new());
        let logs = LogBus::new(100);
        let mut fanout = FanOut::new(snapshot.clone(), sink.clone(), logs);

        fanout.tick_once();
        let first_count = sink.ingest_count.load(Ordering::SeqCst);
        assert!(first_count >= 1);

        fanout.tick_once();
        let second_count = sink.ingest_count.load(Ordering::SeqCst);
        // only the per-tick process event should fire; no driver event
        // since nothing changed.
        assert_eq!(second_count, first_count + 1);
    }

    #[test]
    fn tag_change_emits_tag_event() {
        let snapshot = Snapshot::new();
        snapshot.register_device(device_config());
        let sink = Arc::new(RecordingSink::new());
        let logs = LogBus::new(100);
        let mut fanout = FanOut::new(snapshot.clone(), sink.clone(), logs);
        fanout.tick_once();

        let mut tags = HashMap::new();
        tags.insert(
            "t1".to_string(),
            TagSample::good("dev1", crate::snapshot::Value::Int(42)),
        );
        snapshot.with_record_mut("dev1", |r| r.publish_scan(tags));

        fanout.tick_once();
        let events = sink.events.lock().unwrap();
        assert!(events.iter().any(|(k, id)| *k == IngestKind::Tag && id == "t1"));
    }
}
