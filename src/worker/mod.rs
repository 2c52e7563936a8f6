use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{DeviceConfig, TagConfig};
use crate::drivers::ProtocolDriver;
use crate::logbus::{LogBus, LogLevel};
use crate::routing::DeviceWriteQueue;
use crate::snapshot::{ConnectionState, DriverRecord, Snapshot, TagSample, Value, WriteCommand};

/// Fixed backoff applied after exhausting the retry budget (§4.2).
const BACKOFF: Duration = Duration::from_secs(10);
/// Minimum spacing between repeated "still failing to connect" log lines
/// (§4.2: "log on the first failure and then at most once per 30 s").
const CONNECT_FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Owns one device end-to-end: connect/reconnect loop, scan loop, write
/// queue drain, status publication (§4.2).
///
/// A worker owns its `ProtocolDriver` instance outright — no session
/// handle crosses a task boundary, so a panic or cancellation in one
/// worker cannot corrupt another's state (§9).
pub struct DriverWorker {
    config: DeviceConfig,
    tags: Vec<TagConfig>,
    driver: Box<dyn ProtocolDriver>,
    snapshot: Snapshot,
    writes: DeviceWriteQueue,
    logs: LogBus,
    stop: CancellationToken,
}

/// Outcome of draining one command, logged at the draining site (§4.2).
enum DrainOutcome {
    Written { tag_id: String, confirmed: Option<Value> },
    Rejected { tag_id: String, reason: String },
}

impl DriverWorker {
    pub fn new(
        config: DeviceConfig,
        tags: Vec<TagConfig>,
        driver: Box<dyn ProtocolDriver>,
        snapshot: Snapshot,
        writes: DeviceWriteQueue,
        logs: LogBus,
        stop: CancellationToken,
    ) -> Self {
        DriverWorker {
            config,
            tags,
            driver,
            snapshot,
            writes,
            logs,
            stop,
        }
    }

    fn device_id(&self) -> &str {
        &self.config.id
    }

    fn scan_enabled_tags(&self) -> Vec<TagConfig> {
        self.tags.iter().filter(|t| t.scan_enabled).cloned().collect()
    }

    fn transition(&self, status: ConnectionState, detail: Option<String>) {
        self.snapshot.with_record_mut(self.device_id(), |r| {
            r.transition(status, detail);
        });
    }

    fn mark_all_bad(&self, detail: &str) {
        self.snapshot.with_record_mut(self.device_id(), |r| {
            r.mark_all_bad(detail);
        });
    }

    fn log(&self, level: LogLevel, message: impl Into<String>, details: Option<serde_json::Value>) {
        if self.config.log_enabled {
            self.logs.log(level, self.device_id().to_string(), message, details);
        }
    }

    /// Runs the full STARTING → CONNECTING → SCANNING → BACKOFF/STOPPED
    /// state machine until the stop signal fires (§4.2).
    pub async fn run(mut self) {
        if self.config.endpoint.trim().is_empty() {
            let detail = "missing endpoint in device configuration".to_string();
            error!(device = %self.device_id(), "{detail}");
            self.log(LogLevel::Error, detail.clone(), None);
            self.mark_all_bad(&detail);
            self.transition(ConnectionState::Stopped, Some(detail));
            return;
        }

        'outer: loop {
            if self.stop.is_cancelled() {
                break;
            }

            match self.connect_with_retry().await {
                ConnectOutcome::Connected => {
                    self.transition(ConnectionState::Connected, None);
                    self.log(LogLevel::Success, "connected", None);
                    match self.scan_loop().await {
                        ScanExit::Lost(detail) => {
                            self.transition(ConnectionState::Disconnected, Some(detail.clone()));
                            self.mark_all_bad(&detail);
                            self.log(LogLevel::Warn, format!("connection lost: {detail}"), None);
                            continue 'outer;
                        }
                        ScanExit::Stopped => break 'outer,
                    }
                }
                ConnectOutcome::Stopped => break 'outer,
            }
        }

        self.driver.close().await;
        self.mark_all_bad("worker stopped");
        self.transition(ConnectionState::Stopped, Some("stopped".to_string()));
        self.log(LogLevel::Info, "stopped", None);
    }

    /// CONNECTING + BACKOFF (§4.2): retries up to `retry_count` times,
    /// rate-limiting failure logs, then backs off 10s before trying again.
    /// Loops until connected or the stop signal fires.
    async fn connect_with_retry(&mut self) -> ConnectOutcome {
        loop {
            self.transition(ConnectionState::Starting, None);
            let mut attempts: u32 = 0;
            let mut last_logged = Instant::now() - CONNECT_FAILURE_LOG_INTERVAL;

            loop {
                if self.stop.is_cancelled() {
                    return ConnectOutcome::Stopped;
                }

                let timeout = Duration::from_millis(self.config.connect_timeout_ms);
                let result = tokio::select! {
                    r = self.driver.open(timeout) => r,
                    _ = self.stop.cancelled() => return ConnectOutcome::Stopped,
                };

                match result {
                    Ok(()) => return ConnectOutcome::Connected,
                    Err(e) => {
                        attempts += 1;
                        let now = Instant::now();
                        if attempts == 1 || now.duration_since(last_logged) >= CONNECT_FAILURE_LOG_INTERVAL {
                            warn!(device = %self.device_id(), attempt = attempts, error = %e, "connect failed");
                            self.log(
                                LogLevel::Error,
                                format!("connect attempt {attempts} failed: {e}"),
                                None,
                            );
                            last_logged = now;
                        }

                        if attempts >= self.config.retry_count.max(1) {
                            break;
                        }
                    }
                }
            }

            debug!(device = %self.device_id(), "entering backoff for {:?}", BACKOFF);
            tokio::select! {
                _ = tokio::time::sleep(BACKOFF) => {}
                _ = self.stop.cancelled() => return ConnectOutcome::Stopped,
            }
        }
    }

    /// SCANNING (§4.2): repeat read/drain/sleep until liveness fails, a
    /// transport error surfaces, or the stop signal fires.
    async fn scan_loop(&mut self) -> ScanExit {
        let period = Duration::from_millis(self.config.scan_interval_ms);
        let scan_tags = self.scan_enabled_tags();

        loop {
            if self.stop.is_cancelled() {
                return ScanExit::Stopped;
            }

            let tick_start = Instant::now();

            let (samples, transport_lost) = self.scan_once(&scan_tags).await;
            self.snapshot.with_record_mut(self.device_id(), |r| {
                r.publish_scan(samples);
            });

            if let Some(detail) = transport_lost {
                return ScanExit::Lost(detail);
            }
            if !self.driver.alive() {
                return ScanExit::Lost("liveness probe failed".to_string());
            }

            if self.drain_writes().await {
                return ScanExit::Lost("liveness probe failed during write drain".to_string());
            }

            if period.is_zero() {
                // "as fast as possible" (§8 boundary): yield once per
                // cycle so an idle, zero-tag device doesn't spin the CPU.
                tokio::task::yield_now().await;
                continue;
            }

            let elapsed = tick_start.elapsed();
            let remaining = period.checked_sub(elapsed).unwrap_or(Duration::ZERO);
            if !remaining.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = self.stop.cancelled() => return ScanExit::Stopped,
                }
            }
        }
    }

    /// One read batch (§4.2 step 1). Returns the new tag-id → sample map
    /// plus, if a transport error showed up, the detail that should drive
    /// a reconnect.
    async fn scan_once(&mut self, tags: &[TagConfig]) -> (HashMap<String, TagSample>, Option<String>) {
        if tags.is_empty() {
            return (HashMap::new(), None);
        }

        let results = self.driver.read(tags).await;
        let mut samples = HashMap::with_capacity(tags.len());
        let mut transport_lost = None;

        for (tag, result) in tags.iter().zip(results.into_iter()) {
            match result {
                Ok(value) => {
                    samples.insert(tag.id.clone(), TagSample::good(self.device_id(), value));
                }
                Err(e) => {
                    samples.insert(tag.id.clone(), TagSample::bad(self.device_id(), e.to_string()));
                    if e.is_reconnect_trigger() {
                        transport_lost.get_or_insert_with(|| e.to_string());
                    }
                }
            }
        }

        (samples, transport_lost)
    }

    /// Write-queue drain (§4.2 step 2): consumes up to everything queued
    /// right now, FIFO, in a single pass. Returns `true` if a transport
    /// error surfaced mid-drain (the caller treats this like a scan loss).
    ///
    /// If draining runs long, `scan_loop`'s `remaining = period - elapsed`
    /// naturally floors at zero, so the next scan starts immediately
    /// rather than waiting out the rest of an overrun period (§4.2).
    async fn drain_writes(&mut self) -> bool {
        loop {
            let command = match self.writes.receiver.try_recv() {
                Ok(cmd) => cmd,
                Err(_) => return false,
            };

            let outcome = self.apply_write(command).await;
            match outcome {
                Ok(DrainOutcome::Written { tag_id, confirmed }) => {
                    self.log(
                        LogLevel::Info,
                        format!("write to {tag_id} succeeded"),
                        confirmed.map(|v| serde_json::json!({ "confirmed": format!("{v:?}") })),
                    );
                }
                Ok(DrainOutcome::Rejected { tag_id, reason }) => {
                    self.log(LogLevel::Warn, format!("write to {tag_id} rejected: {reason}"), None);
                }
                Err(e) => {
                    self.log(LogLevel::Error, format!("write failed: {e}"), None);
                    if e.is_reconnect_trigger() {
                        return true;
                    }
                }
            }
        }
    }

    async fn apply_write(&mut self, command: WriteCommand) -> Result<DrainOutcome, crate::error::GatewayError> {
        match command {
            WriteCommand::Single { tag_id, value } => {
                let tag = match self.tags.iter().find(|t| t.id == tag_id) {
                    Some(t) => t.clone(),
                    None => {
                        return Ok(DrainOutcome::Rejected {
                            tag_id,
                            reason: "unknown tag".to_string(),
                        })
                    }
                };
                if !tag.writable {
                    return Ok(DrainOutcome::Rejected {
                        tag_id,
                        reason: "not-writable".to_string(),
                    });
                }

                let outcome = self.driver.write(&tag.address, value, tag.data_kind).await?;
                Ok(DrainOutcome::Written {
                    tag_id,
                    confirmed: outcome.confirmed,
                })
            }
            WriteCommand::SqlBatch { device_id, values, row_id } => {
                self.driver.write_batch(values, row_id).await?;
                Ok(DrainOutcome::Written {
                    tag_id: device_id,
                    confirmed: None,
                })
            }
        }
    }
}

enum ConnectOutcome {
    Connected,
    Stopped,
}

enum ScanExit {
    Lost(String),
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataKind, Protocol};
    use crate::drivers::WriteOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    /// In-process test double standing in for a real protocol session,
    /// exercising the worker's connect/scan/write-drain state machine
    /// without any network I/O.
    struct MockDriver {
        opens: AtomicUsize,
        alive: AtomicBool,
        fail_reads: AtomicBool,
        written: StdMutex<Vec<(String, Value)>>,
    }

    impl MockDriver {
        fn new() -> Self {
            MockDriver {
                opens: AtomicUsize::new(0),
                alive: AtomicBool::new(true),
                fail_reads: AtomicBool::new(false),
                written: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProtocolDriver for MockDriver {
        async fn open(&mut self, _timeout: Duration) -> crate::error::DriverResult<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn read(&mut self, tags: &[TagConfig]) -> Vec<crate::error::DriverResult<Value>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return tags
                    .iter()
                    .map(|_| Err(crate::error::GatewayError::Transport("link down".into())))
                    .collect();
            }
            tags.iter().map(|_| Ok(Value::Int(7))).collect()
        }

        async fn write(&mut self, address: &str, value: Value, _kind: DataKind) -> crate::error::DriverResult<WriteOutcome> {
            self.written.lock().unwrap().push((address.to_string(), value));
            Ok(WriteOutcome::unconfirmed())
        }

        async fn close(&mut self) {
            self.alive.store(false, Ordering::SeqCst);
        }

        fn alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn device_config(endpoint: &str) -> DeviceConfig {
        DeviceConfig {
            id: "plc1".into(),
            name: "Main PLC".into(),
            protocol: Protocol::ModbusTcp,
            endpoint: endpoint.into(),
            scan_interval_ms: 0,
            connect_timeout_ms: 100,
            retry_count: 1,
            log_enabled: true,
            slave_id: None,
            client_id: None,
            username: None,
            password: None,
            table_name: None,
            db_kind: None,
        }
    }

    fn tag(id: &str, writable: bool) -> TagConfig {
        TagConfig {
            id: id.into(),
            device_id: "plc1".into(),
            name: id.into(),
            address: "40001".into(),
            data_kind: DataKind::Int,
            scan_enabled: true,
            writable,
            display_field: None,
        }
    }

    fn make_worker(
        config: DeviceConfig,
        tags: Vec<TagConfig>,
        driver: MockDriver,
    ) -> (DriverWorker, Snapshot, mpsc::Sender<WriteCommand>, CancellationToken) {
        let snapshot = Snapshot::new();
        snapshot.register_device(config.clone());
        let (tx, rx) = mpsc::channel(8);
        let writes = DeviceWriteQueue {
            device_id: config.id.clone(),
            receiver: rx,
        };
        let logs = LogBus::new(100);
        let stop = CancellationToken::new();
        let worker = DriverWorker::new(config, tags, Box::new(driver), snapshot.clone(), writes, logs, stop.clone());
        (worker, snapshot, tx, stop)
    }

    #[tokio::test]
    async fn missing_endpoint_stops_without_connecting() {
        let (worker, snapshot, _tx, _stop) = make_worker(device_config(""), vec![tag("t1", false)], MockDriver::new());
        worker.run().await;

        let record = snapshot.get("plc1").unwrap();
        assert_eq!(record.status, ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn connects_and_publishes_good_samples() {
        let (worker, snapshot, _tx, stop) =
            make_worker(device_config("127.0.0.1:1502"), vec![tag("t1", true)], MockDriver::new());

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = snapshot.get("plc1").unwrap();
        assert_eq!(record.status, ConnectionState::Connected);
        assert_eq!(record.tags["t1"].quality, crate::snapshot::Quality::Good);

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn non_writable_tag_rejects_queued_write() {
        let (worker, snapshot, tx, stop) =
            make_worker(device_config("127.0.0.1:1502"), vec![tag("t1", false)], MockDriver::new());

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.try_send(WriteCommand::Single {
            tag_id: "t1".to_string(),
            value: Value::Int(99),
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        // the write was rejected, not applied; the tag's last good read
        // still reflects the mock driver's own value, not 99.
        let record = snapshot.get("plc1").unwrap();
        assert_eq!(record.tags["t1"].value, Some(Value::Int(7)));

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn transport_error_marks_every_tag_bad_and_keeps_retrying() {
        let driver = MockDriver::new();
        driver.fail_reads.store(true, Ordering::SeqCst);
        let (worker, snapshot, _tx, stop) =
            make_worker(device_config("127.0.0.1:1502"), vec![tag("t1", false)], driver);

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = snapshot.get("plc1").unwrap();
        assert_eq!(record.tags["t1"].quality, crate::snapshot::Quality::Bad);

        stop.cancel();
        handle.await.unwrap();
    }
}
