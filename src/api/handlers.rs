use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::api::dto::{
    status_str, BatchWriteRequest, DriverDto, HealthResponse, LogQuery, RestartResponse, TagSampleDto, WriteRequest,
    WriteResponse,
};
use crate::error::{ErrorBody, GatewayError};
use crate::logbus::LogLevel;
use crate::supervisor::Supervisor;

/// Shared state handed to every handler (§4.7).
#[derive(Clone)]
pub struct SharedAppState {
    pub supervisor: Arc<Supervisor>,
    pub start_time: tokio::time::Instant,
}

pub fn create_api_routes() -> Router<SharedAppState> {
    use axum::routing::{get, post};

    Router::new()
        .route("/api/dados", get(get_dados))
        .route("/api/escrever", post(post_escrever))
        .route("/api/escrever_lote", post(post_escrever_lote))
        .route("/api/logs", get(get_logs))
        .route("/api/system/restart", post(post_restart))
        .route("/api/health", get(get_health))
        .route("/api/ia/status", get(get_ia_status))
        .route("/api/ia/metricas", get(get_ia_metricas))
        .route("/api/ia/conhecimento", get(get_ia_conhecimento))
}

/// `GET /api/dados`: the full live snapshot, one entry per device (§4.7).
async fn get_dados(State(state): State<SharedAppState>) -> impl IntoResponse {
    let snapshot = state.supervisor.snapshot();
    let drivers: HashMap<String, DriverDto> = snapshot
        .all()
        .into_iter()
        .map(|(id, record)| {
            let tags = record
                .tags
                .iter()
                .map(|(tag_id, sample)| (tag_id.clone(), TagSampleDto::from(sample)))
                .collect();
            (
                id,
                DriverDto {
                    status: status_str(record.status),
                    detail: record.detail,
                    timestamp: record.timestamp.to_rfc3339(),
                    config: record.config,
                    tags,
                },
            )
        })
        .collect();

    Json(drivers)
}

/// `POST /api/escrever`: single-tag write (§4.7, §4.4).
async fn post_escrever(
    State(state): State<SharedAppState>,
    Json(body): Json<WriteRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let router = state.supervisor.router().await;
    let cognitive = state.supervisor.cognitive();

    router
        .enqueue(cognitive.as_write_policy(), &body.tag_id, body.valor)
        .await?;

    info!(tag_id = %body.tag_id, "write accepted");
    Ok(Json(WriteResponse::ok(format!("write to {} queued", body.tag_id))))
}

/// `POST /api/escrever_lote`: SQL multi-column batch write (§4.7, §4.1).
async fn post_escrever_lote(
    State(state): State<SharedAppState>,
    Json(body): Json<BatchWriteRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let router = state.supervisor.router().await;
    let cognitive = state.supervisor.cognitive();

    let row_id = match (body.row_id_column, body.row_id_value) {
        (Some(column), Some(value)) => Some((column, value)),
        _ => None,
    };

    router
        .enqueue_batch(cognitive.as_write_policy(), &body.driver_id, body.valores, row_id)
        .await?;

    info!(driver_id = %body.driver_id, "batch write accepted");
    Ok(Json(WriteResponse::ok(format!(
        "batch write to {} queued",
        body.driver_id
    ))))
}

/// `GET /api/logs?limit=&since=&level=`: the log bus, newest constraints
/// applied via `LogBus::query` (§4.7, §4.8).
async fn get_logs(
    State(state): State<SharedAppState>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let since: Option<DateTime<Utc>> = match query.since {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| GatewayError::Coercion(format!("invalid since timestamp: {e}")))?,
        ),
        None => None,
    };

    let level = match query.level {
        Some(raw) => Some(parse_level(&raw)?),
        None => None,
    };

    let records = state.supervisor.logs().query(query.limit, since, level);
    Ok(Json(records))
}

fn parse_level(raw: &str) -> Result<LogLevel, GatewayError> {
    match raw.to_ascii_lowercase().as_str() {
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" | "warning" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        "fatal" => Ok(LogLevel::Fatal),
        "success" => Ok(LogLevel::Success),
        other => Err(GatewayError::Coercion(format!("unknown log level: {other}"))),
    }
}

/// `POST /api/system/restart` (§4.7, §5): stop-then-start of the worker
/// set with the HTTP server staying up throughout.
async fn post_restart(State(state): State<SharedAppState>) -> Result<impl IntoResponse, GatewayError> {
    warn!("restart requested via HTTP control plane");
    state.supervisor.restart().await?;
    Ok(Json(RestartResponse {
        sucesso: true,
        mensagem: "restart complete".to_string(),
    }))
}

/// `GET /api/health` (§4.7): process/system metrics plus driver/tag
/// counts, replacing the original's `psutil` reads with `sysinfo`.
async fn get_health(State(state): State<SharedAppState>) -> impl IntoResponse {
    let snapshot = state.supervisor.snapshot();
    let all = snapshot.all();

    let drivers_total = all.len();
    let drivers_active = all
        .iter()
        .filter(|(_, r)| r.status == crate::snapshot::ConnectionState::Connected)
        .count();
    let drivers_disconnected = drivers_total - drivers_active;

    let mut tags_total = 0usize;
    let mut tags_good = 0usize;
    for (_, record) in &all {
        tags_total += record.tags.len();
        tags_good += record
            .tags
            .values()
            .filter(|t| t.quality == crate::snapshot::Quality::Good)
            .count();
    }

    let mut system = sysinfo::System::new();
    let pid = sysinfo::Pid::from_u32(std::process::id());
    system.refresh_process(pid);
    let (process_cpu_percent, process_rss_mb) = system
        .process(pid)
        .map(|p| (p.cpu_usage() as f64, p.memory() as f64 / (1024.0 * 1024.0)))
        .unwrap_or((0.0, 0.0));

    system.refresh_cpu();
    let system_cpu_percent = system.global_cpu_info().cpu_usage() as f64;

    Json(HealthResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        process_rss_mb,
        process_cpu_percent,
        system_cpu_percent,
        drivers_total,
        drivers_active,
        drivers_disconnected,
        tags_total,
        tags_good,
    })
}

/// `GET /api/ia/status` (§4.6, §4.7): 404 when the cognitive sink has no
/// status to report.
async fn get_ia_status(State(state): State<SharedAppState>) -> impl IntoResponse {
    match state.supervisor.cognitive().status() {
        Some(value) => (StatusCode::OK, Json(value)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(ErrorBody::new("no cognitive status available"))).into_response(),
    }
}

async fn get_ia_metricas(State(state): State<SharedAppState>) -> impl IntoResponse {
    match state.supervisor.cognitive().metrics() {
        Some(value) => (StatusCode::OK, Json(value)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(ErrorBody::new("no cognitive metrics available"))).into_response(),
    }
}

async fn get_ia_conhecimento(State(state): State<SharedAppState>) -> impl IntoResponse {
    match state.supervisor.cognitive().knowledge() {
        Some(value) => (StatusCode::OK, Json(value)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(ErrorBody::new("no cognitive knowledge available"))).into_response(),
    }
}
