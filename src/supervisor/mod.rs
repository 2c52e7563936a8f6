use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cognitive::CognitiveSink;
use crate::config::GatewayConfig;
use crate::drivers::build_driver;
use crate::error::GatewayError;
use crate::fanout::FanOut;
use crate::logbus::{LogBus, LogLevel};
use crate::routing::{DeviceWriteQueue, Router};
use crate::snapshot::Snapshot;
use crate::worker::DriverWorker;

/// One running generation of the worker set plus the fan-out task that
/// rides on top of it. Replaced wholesale on restart (§5).
struct RunningState {
    router: Arc<Router>,
    worker_stop: Vec<CancellationToken>,
    worker_tasks: Vec<JoinHandle<()>>,
    fanout_stop: CancellationToken,
    fanout_task: Option<JoinHandle<()>>,
}

/// Top-level lifecycle orchestrator (§2, §5): loads configuration, builds
/// the routing fabric and one worker per device, starts the fan-out, and
/// owns restart (stop-then-start of the worker set while HTTP stays up).
///
/// Grounded on `original_source/modulos/sistema.py::SistemaPrincipal`
/// (`iniciar_subsistemas`/`parar`/`reinicializar_sistema`), translated
/// from multiprocessing into tokio tasks plus a `CancellationToken` per
/// worker for cooperative shutdown (§5).
pub struct Supervisor {
    config_path: PathBuf,
    snapshot: Snapshot,
    logs: LogBus,
    cognitive: Arc<dyn CognitiveSink>,
    queue_capacity: usize,
    state: AsyncMutex<RunningState>,
}

impl Supervisor {
    /// Loads configuration, builds the initial worker set and fan-out,
    /// and returns the running supervisor. The only fallible step is the
    /// initial configuration load (§6: non-zero exit on missing/unreadable
    /// configuration).
    pub async fn start(
        config_path: PathBuf,
        logs: LogBus,
        cognitive: Arc<dyn CognitiveSink>,
        queue_capacity: usize,
    ) -> Result<Arc<Supervisor>, GatewayError> {
        let config = GatewayConfig::load(&config_path)
            .map_err(|e| GatewayError::Configuration(format!("failed to load {config_path:?}: {e}")))?;

        let snapshot = Snapshot::new();
        let state = Self::spawn_generation(&config, &snapshot, &logs, &cognitive, queue_capacity);

        Ok(Arc::new(Supervisor {
            config_path,
            snapshot,
            logs,
            cognitive,
            queue_capacity,
            state: AsyncMutex::new(state),
        }))
    }

    fn spawn_generation(
        config: &GatewayConfig,
        snapshot: &Snapshot,
        logs: &LogBus,
        cognitive: &Arc<dyn CognitiveSink>,
        queue_capacity: usize,
    ) -> RunningState {
        for device in config.all_devices() {
            snapshot.register_device(device.clone());
        }

        let (router, queues) = Router::build(config, queue_capacity);

        let mut worker_stop = Vec::new();
        let mut worker_tasks = Vec::new();
        for queue in queues {
            let device = config
                .all_devices()
                .into_iter()
                .find(|d| d.id == queue.device_id)
                .expect("router only yields queues for configured devices")
                .clone();
            let tags = config.tags_for_device(&device.id).into_iter().cloned().collect();

            let driver = match build_driver(&device) {
                Ok(d) => d,
                Err(e) => {
                    error!(device = %device.id, error = %e, "failed to build driver, device disabled");
                    logs.log(
                        LogLevel::Error,
                        device.id.clone(),
                        format!("failed to build driver: {e}"),
                        None,
                    );
                    snapshot.with_record_mut(&device.id, |r| {
                        r.mark_all_bad(format!("configuration error: {e}"));
                        r.transition(crate::snapshot::ConnectionState::Stopped, Some(e.to_string()));
                    });
                    continue;
                }
            };

            let stop = CancellationToken::new();
            let worker = DriverWorker::new(device, tags, driver, snapshot.clone(), queue, logs.clone(), stop.clone());
            worker_stop.push(stop);
            worker_tasks.push(tokio::spawn(worker.run()));
        }

        let fanout_stop = CancellationToken::new();
        let fanout = FanOut::new(snapshot.clone(), cognitive.clone(), logs.clone());
        let fanout_task = tokio::spawn(fanout.run(fanout_stop.clone()));

        RunningState {
            router,
            worker_stop,
            worker_tasks,
            fanout_stop,
            fanout_task: Some(fanout_task),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.clone()
    }

    pub fn logs(&self) -> LogBus {
        self.logs.clone()
    }

    pub fn cognitive(&self) -> Arc<dyn CognitiveSink> {
        self.cognitive.clone()
    }

    pub async fn router(&self) -> Arc<Router> {
        self.state.lock().await.router.clone()
    }

    /// Restart (§4.7, §5): stop {fan-out, workers}, clear the snapshot,
    /// reload configuration, rebuild the routing table and worker set,
    /// resume. Pending writes in the old queues are dropped and logged
    /// (§5); the HTTP server stays up throughout.
    pub async fn restart(&self) -> Result<(), GatewayError> {
        let config = GatewayConfig::load(&self.config_path)
            .map_err(|e| GatewayError::Configuration(format!("failed to reload {:?}: {e}", self.config_path)))?;

        let mut guard = self.state.lock().await;

        guard.fanout_stop.cancel();
        if let Some(task) = guard.fanout_task.take() {
            let _ = task.await;
        }

        for stop in &guard.worker_stop {
            stop.cancel();
        }
        for task in guard.worker_tasks.drain(..) {
            let _ = task.await;
        }

        self.logs.log(
            LogLevel::Warn,
            "supervisor",
            "restart: any writes still queued for the previous worker set were dropped",
            None,
        );

        self.snapshot.clear();

        let new_state = Self::spawn_generation(&config, &self.snapshot, &self.logs, &self.cognitive, self.queue_capacity);
        *guard = new_state;

        info!("restart complete");
        self.logs.log(LogLevel::Success, "supervisor", "restart complete", None);
        Ok(())
    }

    /// Cooperative full shutdown: stops fan-out and every worker, waits
    /// for them to exit.
    pub async fn shutdown(&self) {
        let mut guard = self.state.lock().await;
        guard.fanout_stop.cancel();
        if let Some(task) = guard.fanout_task.take() {
            let _ = task.await;
        }
        for stop in &guard.worker_stop {
            stop.cancel();
        }
        for task in guard.worker_tasks.drain(..) {
            let _ = task.await;
        }
    }
}
