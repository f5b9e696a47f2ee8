use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::NaiveDate;
use serde_json::{json, Value};
use shared::{
    domain::{ConnectionId, StepId},
    protocol::{DateRange, FunnelReportRequest, FunnelStep},
};
use tokio::{net::TcpListener, sync::Mutex};
use url::Url;

use crate::{HttpReportFetcher, MissingReportFetcher, ReportFetchError, ReportFetcher};

#[derive(Clone, Default)]
struct ServerState {
    received: Arc<Mutex<Vec<(i64, Value)>>>,
}

async fn handle_funnel_report(
    State(state): State<ServerState>,
    Path(connection_id): Path<i64>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    state.received.lock().await.push((connection_id, payload));
    Json(json!({
        "data": {
            "steps": [
                { "id": 1, "users": 200 },
                { "id": 2, "users": 50, "label": "Checkout" }
            ]
        }
    }))
}

async fn handle_validation_error() -> impl IntoResponse {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "message": "The start date field is required.",
            "errors": { "startDate": ["The start date field is required."] }
        })),
    )
}

async fn handle_plain_failure() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded\n")
}

async fn handle_garbage() -> impl IntoResponse {
    "definitely not json"
}

async fn spawn_report_server() -> Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/api/connections/:connection_id/reports/funnel",
            post(handle_funnel_report),
        )
        .route(
            "/invalid/connections/:connection_id/reports/funnel",
            post(handle_validation_error),
        )
        .route(
            "/broken/connections/:connection_id/reports/funnel",
            post(handle_plain_failure),
        )
        .route(
            "/garbage/connections/:connection_id/reports/funnel",
            post(handle_garbage),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn request() -> FunnelReportRequest {
    let range = DateRange::new(
        NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
        NaiveDate::from_ymd_opt(2024, 3, 31).expect("date"),
    )
    .expect("range");
    let mut landing = FunnelStep::new(StepId(1));
    landing
        .attributes
        .insert("name".to_string(), json!("Landing"));
    FunnelReportRequest::new(range, vec![landing, FunnelStep::new(StepId(2))])
}

fn fetcher(base: &str) -> HttpReportFetcher {
    HttpReportFetcher::new(Url::parse(base).expect("url"))
}

#[tokio::test]
async fn posts_request_and_unwraps_data_envelope() {
    let (server_url, state) = spawn_report_server().await.expect("spawn server");

    let report = fetcher(&format!("{server_url}/api"))
        .fetch(ConnectionId(42), &request())
        .await
        .expect("report");

    assert_eq!(report.error, None);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].users, 200);
    assert_eq!(report.steps[1].extra["label"], json!("Checkout"));

    let received = state.received.lock().await;
    assert_eq!(received.len(), 1);
    let (connection_id, payload) = &received[0];
    assert_eq!(*connection_id, 42);
    assert_eq!(payload["startDate"], json!("2024-03-01"));
    assert_eq!(payload["endDate"], json!("2024-03-31"));
    assert_eq!(payload["steps"][0], json!({ "id": 1, "name": "Landing" }));
}

#[tokio::test]
async fn trailing_slash_in_api_url_is_tolerated() {
    let (server_url, state) = spawn_report_server().await.expect("spawn server");

    fetcher(&format!("{server_url}/api/"))
        .fetch(ConnectionId(7), &request())
        .await
        .expect("report");

    assert_eq!(state.received.lock().await[0].0, 7);
}

#[tokio::test]
async fn backend_error_envelope_becomes_status_error() {
    let (server_url, _state) = spawn_report_server().await.expect("spawn server");

    let err = fetcher(&format!("{server_url}/invalid"))
        .fetch(ConnectionId(1), &request())
        .await
        .expect_err("must fail");

    match err {
        ReportFetchError::Status { status, message } => {
            assert_eq!(status, 422);
            assert_eq!(message, "The start date field is required.");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn plain_text_failure_keeps_the_body_as_message() {
    let (server_url, _state) = spawn_report_server().await.expect("spawn server");

    let err = fetcher(&format!("{server_url}/broken"))
        .fetch(ConnectionId(1), &request())
        .await
        .expect_err("must fail");

    assert!(matches!(
        err,
        ReportFetchError::Status { status: 500, ref message } if message == "upstream exploded"
    ));
}

#[tokio::test]
async fn malformed_payload_is_a_decode_error() {
    let (server_url, _state) = spawn_report_server().await.expect("spawn server");

    let err = fetcher(&format!("{server_url}/garbage"))
        .fetch(ConnectionId(1), &request())
        .await
        .expect_err("must fail");

    assert!(matches!(err, ReportFetchError::Decode(_)), "{err}");
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_error() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = fetcher(&format!("http://{addr}/api"))
        .fetch(ConnectionId(1), &request())
        .await
        .expect_err("must fail");

    assert!(matches!(err, ReportFetchError::Transport(_)), "{err}");
}

#[tokio::test]
async fn missing_fetcher_always_fails() {
    let err = MissingReportFetcher
        .fetch(ConnectionId(3), &request())
        .await
        .expect_err("must fail");

    assert!(err.to_string().contains("connection 3"), "{err}");
}
