//! In-process scenario tests for tgw-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tgw_config::{DeviceConfig, GatewayConfig, StorageConfig, StorageMode};
use tgw_daemon::{routes, state};
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lamp() -> DeviceConfig {
    DeviceConfig {
        id: "lamp".to_string(),
        title: Some("Desk lamp".to_string()),
        properties: BTreeMap::from([("level".to_string(), json!(0))]),
        actions: vec!["fade".to_string()],
        events: vec!["overheated".to_string()],
    }
}

fn config(storage: StorageConfig) -> GatewayConfig {
    GatewayConfig {
        storage,
        devices: vec![lamp()],
        ..GatewayConfig::default()
    }
}

/// Fresh state over the simulated store with its signals pumped.
fn make_state(storage: StorageConfig) -> Arc<state::AppState> {
    let (st, _store, signals) = state::AppState::simulated(&config(storage));
    let st = Arc::new(st);
    state::spawn_signal_pump(Arc::clone(&st.correlator), signals);
    st
}

/// Drive the router with a single request and return (status, body_bytes).
async fn call(st: &Arc<state::AppState>, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = routes::build_router(Arc::clone(st))
        .oneshot(req)
        .await
        .expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn with_json(method: &str, uri: &str, body: serde_json::Value) -> Request<axum::body::Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

// ---------------------------------------------------------------------------
// GET /v1/health, /v1/things
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let st = make_state(StorageConfig::default());
    let (status, body) = call(&st, get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "tgw-daemon");
}

#[tokio::test]
async fn things_lists_configured_devices_without_upgrade() {
    let st = make_state(StorageConfig::default());
    let (status, body) = call(&st, get("/v1/things")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json.as_array().map(Vec::len), Some(1));
    assert_eq!(json[0]["id"], "lamp");
    assert_eq!(json[0]["title"], "Desk lamp");
    assert_eq!(json[0]["properties"], json!(["level"]));
}

#[tokio::test]
async fn unknown_thing_is_404() {
    let st = make_state(StorageConfig::default());
    let (status, body) = call(&st, get("/v1/things/toaster")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(parse_json(body)["error"]
        .as_str()
        .unwrap()
        .contains("toaster"));
}

// ---------------------------------------------------------------------------
// GET|PUT /v1/things/:id/properties/:name
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_property_reads_seeded_value() {
    let st = make_state(StorageConfig::default());
    let (status, body) = call(&st, get("/v1/things/lamp/properties/level")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body), json!({"level": 0}));
}

#[tokio::test]
async fn put_property_writes_and_records_request() {
    let st = make_state(StorageConfig::default());
    let (status, body) = call(
        &st,
        with_json("PUT", "/v1/things/lamp/properties/level", json!({"level": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body), json!({"level": 0}));

    let snap = st.log.snapshot();
    assert_eq!(snap.requests.len(), 1);
    assert_eq!(snap.db_writes, vec![json!(0)]);
    assert_eq!(snap.intervals.len(), 1);
    // Nobody was connected to observe it.
    assert!(snap.notifications.is_empty());
}

#[tokio::test]
async fn put_property_without_named_key_is_400() {
    let st = make_state(StorageConfig::default());
    let (status, _) = call(
        &st,
        with_json("PUT", "/v1/things/lamp/properties/level", json!({"other": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(st.log.snapshot().is_empty());
}

#[tokio::test]
async fn put_unknown_property_is_404_and_not_written() {
    let st = make_state(StorageConfig::default());
    let (status, _) = call(
        &st,
        with_json("PUT", "/v1/things/lamp/properties/color", json!({"color": "red"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(st.log.snapshot().db_writes.is_empty());
}

#[tokio::test]
async fn delayed_put_resolves_through_finished_signal() {
    let st = make_state(StorageConfig {
        mode: StorageMode::Delayed,
        apply_delay_ms: 10,
        stale_reads: false,
    });
    let (status, body) = call(
        &st,
        with_json("PUT", "/v1/things/lamp/properties/level", json!({"level": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body), json!({"level": 4}));

    let snap = st.log.snapshot();
    assert_eq!(snap.counters.delayed_requests, 1);
    assert_eq!(snap.intervals.len(), 1);
    assert!(st.correlator.pending_tokens().is_empty());
}

// ---------------------------------------------------------------------------
// /v1/storage/*
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finished_signal_before_any_write_becomes_marker() {
    let st = make_state(StorageConfig::default());
    let (status, body) = call(
        &st,
        with_json(
            "POST",
            "/v1/storage/finished",
            json!({"message": "update lamp/level tok-9"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(parse_json(body)["token"], "tok-9");
    assert_eq!(st.correlator.finished_markers(), vec!["tok-9".to_string()]);
}

#[tokio::test]
async fn consistency_error_route_bumps_matching_counter() {
    let st = make_state(StorageConfig::default());
    for message in ["GLOBAL two writers", "LOCAL stale read", "unrelated chatter"] {
        let (status, _) = call(
            &st,
            with_json(
                "POST",
                "/v1/storage/consistency-error",
                json!({ "message": message }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, body) = call(&st, get("/v1/diagnostics/summary")).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["counters"]["global_concurrent_write"], 1);
    assert_eq!(json["counters"]["local_detection"], 1);
    assert_eq!(json["counters"]["not_persisted"], 0);
}

// ---------------------------------------------------------------------------
// /v1/diagnostics/*
// ---------------------------------------------------------------------------

#[tokio::test]
async fn report_is_plain_text_with_counts() {
    let st = make_state(StorageConfig::default());
    let _ = call(
        &st,
        with_json("PUT", "/v1/things/lamp/properties/level", json!({"level": 0})),
    )
    .await;

    let resp = routes::build_router(Arc::clone(&st))
        .oneshot(get("/v1/diagnostics/report"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("requests: 1"));
    assert!(text.contains("unobserved: 1"));
    assert!(text.contains("#0 value=0 -> unobserved"));
}

#[tokio::test]
async fn reset_clears_streams_and_counters_together() {
    let st = make_state(StorageConfig::default());
    let _ = call(
        &st,
        with_json("PUT", "/v1/things/lamp/properties/level", json!({"level": 0})),
    )
    .await;
    let _ = call(
        &st,
        with_json(
            "POST",
            "/v1/storage/consistency-error",
            json!({"message": "NOT_PERSISTED dropped"}),
        ),
    )
    .await;
    assert!(!st.log.snapshot().is_empty());

    let (status, body) = call(&st, with_json("POST", "/v1/diagnostics/reset", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["reset"], true);

    let (_, body) = call(&st, get("/v1/diagnostics/summary")).await;
    let json = parse_json(body);
    assert_eq!(json["requests"], json!([]));
    assert_eq!(json["counters"]["not_persisted"], 0);
    assert!(st.log.snapshot().is_empty());
}

#[tokio::test]
async fn reset_also_forgets_early_completion_markers() {
    let st = make_state(StorageConfig::default());
    let _ = call(
        &st,
        with_json(
            "POST",
            "/v1/storage/finished",
            json!({"message": "update lamp/level tok-9"}),
        ),
    )
    .await;
    assert_eq!(st.correlator.finished_markers(), vec!["tok-9".to_string()]);

    let (status, _) = call(&st, with_json("POST", "/v1/diagnostics/reset", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(st.correlator.finished_markers().is_empty());
    assert!(st.correlator.pending_tokens().is_empty());
}
