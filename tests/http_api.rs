use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use scadagate::api::{create_api_routes, SharedAppState};
use scadagate::cognitive::NullCognitiveSink;
use scadagate::logbus::LogBus;
use scadagate::supervisor::Supervisor;
use tower::ServiceExt;

fn write_temp_config(contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!(
        "scadagate-http-test-{}-{}.toml",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

async fn create_test_app() -> (Router, std::path::PathBuf) {
    let config_path = write_temp_config(
        r#"
        [[projetos]]
        id = "line1"

        [[projetos.drivers]]
        id = "plc1"
        name = "Main PLC"
        protocol = "modbus_tcp"
        endpoint = "127.0.0.1:59999"

        [[projetos.tags]]
        id = "speed"
        device_id = "plc1"
        name = "Speed"
        address = "40001"
        data_kind = "int"
        writable = true
        "#,
    );

    let logs = LogBus::new(100);
    let supervisor = Supervisor::start(config_path.clone(), logs, Arc::new(NullCognitiveSink), 16)
        .await
        .unwrap();

    let state = SharedAppState {
        supervisor,
        start_time: tokio::time::Instant::now(),
    };

    (create_api_routes().with_state(state), config_path)
}

#[tokio::test]
async fn dados_endpoint_lists_configured_devices() {
    let (app, config_path) = create_test_app().await;

    let request = Request::builder()
        .uri("/api/dados")
        .method(Method::GET)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body.get("plc1").is_some());

    std::fs::remove_file(config_path).ok();
}

#[tokio::test]
async fn escrever_rejects_unknown_tag() {
    let (app, config_path) = create_test_app().await;

    let request = Request::builder()
        .uri("/api/escrever")
        .method(Method::POST)
        .header("content-type", "application/json")
        .body(Body::from(r#"{"tag_id":"does-not-exist","valor":1}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    std::fs::remove_file(config_path).ok();
}

#[tokio::test]
async fn escrever_accepts_writable_tag() {
    let (app, config_path) = create_test_app().await;

    let request = Request::builder()
        .uri("/api/escrever")
        .method(Method::POST)
        .header("content-type", "application/json")
        .body(Body::from(r#"{"tag_id":"speed","valor":42}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    std::fs::remove_file(config_path).ok();
}

#[tokio::test]
async fn logs_endpoint_returns_an_array() {
    let (app, config_path) = create_test_app().await;

    let request = Request::builder()
        .uri("/api/logs?limit=10")
        .method(Method::GET)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body.is_array());

    std::fs::remove_file(config_path).ok();
}

#[tokio::test]
async fn health_endpoint_reports_driver_and_tag_counts() {
    let (app, config_path) = create_test_app().await;

    let request = Request::builder()
        .uri("/api/health")
        .method(Method::GET)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["drivers_total"], 1);

    std::fs::remove_file(config_path).ok();
}

/// With `NullCognitiveSink`, none of the `/api/ia/*` endpoints have
/// anything to report (§4.6: `None` means the endpoint 404s).
#[tokio::test]
async fn ia_endpoints_404_without_a_scoring_sink() {
    let (app, config_path) = create_test_app().await;

    let request = Request::builder()
        .uri("/api/ia/status")
        .method(Method::GET)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    std::fs::remove_file(config_path).ok();
}
