//! Axum router and all HTTP handlers for tgw-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Tests compose the bare router directly.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{Map, Value};
use tracing::info;

use tgw_analyzer::{analyze, render_text};
use tgw_correlator::WriteError;
use tgw_schemas::completion_token;

use crate::{
    api_types::{ErrorResponse, HealthResponse, ResetResponse, SignalAccepted, SignalRequest},
    devices::{DeviceDescription, DeviceError, DeviceSource},
    hub::{connection::serve_socket, Scope},
    state::AppState,
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/things", get(things))
        .route("/v1/things/:id", get(thing))
        .route(
            "/v1/things/:id/properties/:name",
            get(get_property).put(put_property),
        )
        .route("/v1/diagnostics/report", get(diagnostics_report))
        .route("/v1/diagnostics/summary", get(diagnostics_summary))
        .route("/v1/diagnostics/reset", post(diagnostics_reset))
        .route("/v1/storage/finished", post(storage_finished))
        .route("/v1/storage/consistency-error", post(storage_consistency_error))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.clone(),
            version: st.build.version.clone(),
            config_hash: st.config_hash.clone(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/things, GET /v1/things/:id
// ---------------------------------------------------------------------------

/// WebSocket upgrade follows every device; a plain GET lists them.
pub(crate) async fn things(
    State(st): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        let hub = st.hub.clone();
        return ws.on_upgrade(move |socket| serve_socket(socket, hub, Scope::AllDevices));
    }

    let listing: Vec<DeviceDescription> = st
        .devices
        .device_ids()
        .iter()
        .filter_map(|id| st.devices.get_device(id))
        .collect();
    (StatusCode::OK, Json(listing)).into_response()
}

/// WebSocket upgrade follows one device; a plain GET describes it.
///
/// An unknown id is still upgraded: the session reports 404 in-band and
/// closes.
pub(crate) async fn thing(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        let hub = st.hub.clone();
        return ws.on_upgrade(move |socket| serve_socket(socket, hub, Scope::Device(id)));
    }

    match st.devices.get_device(&id) {
        Some(description) => (StatusCode::OK, Json(description)).into_response(),
        None => device_error(DeviceError::NotFound(id)),
    }
}

// ---------------------------------------------------------------------------
// GET|PUT /v1/things/:id/properties/:name
// ---------------------------------------------------------------------------

pub(crate) async fn get_property(
    State(st): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
) -> Response {
    match st.devices.get_property(&id, &name).await {
        Ok(value) => property_body(name, value),
        Err(err) => device_error(err),
    }
}

/// Body is `{ "<name>": <value> }`; the response carries the value read back
/// from storage after the write completed, `null` if the write failed.
pub(crate) async fn put_property(
    State(st): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    Json(mut body): Json<Map<String, Value>>,
) -> Response {
    let Some(value) = body.remove(&name) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("body must contain \"{name}\""))),
        )
            .into_response();
    };

    match st.devices.set_property(&id, &name, value).await {
        Ok(observed) => property_body(name, observed),
        Err(err) => device_error(err),
    }
}

fn property_body(name: String, value: Value) -> Response {
    let mut body = Map::new();
    body.insert(name, value);
    (StatusCode::OK, Json(body)).into_response()
}

fn device_error(err: DeviceError) -> Response {
    let status = match &err {
        DeviceError::NotFound(_)
        | DeviceError::UnknownProperty { .. }
        | DeviceError::UnknownAction { .. } => StatusCode::NOT_FOUND,
        DeviceError::Write(WriteError::Expired { .. }) => StatusCode::GATEWAY_TIMEOUT,
        DeviceError::Write(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(ErrorResponse::new(err.to_string()))).into_response()
}

// ---------------------------------------------------------------------------
// /v1/diagnostics/*
// ---------------------------------------------------------------------------

pub(crate) async fn diagnostics_report(State(st): State<Arc<AppState>>) -> Response {
    let report = analyze(&st.log.snapshot());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        render_text(&report),
    )
        .into_response()
}

pub(crate) async fn diagnostics_summary(State(st): State<Arc<AppState>>) -> Response {
    let report = analyze(&st.log.snapshot());
    (StatusCode::OK, Json(report)).into_response()
}

pub(crate) async fn diagnostics_reset(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    st.log.reset();
    let abandoned = st.correlator.reset();
    info!(abandoned, "diagnostics reset");
    (StatusCode::OK, Json(ResetResponse { reset: true }))
}

// ---------------------------------------------------------------------------
// /v1/storage/*
// ---------------------------------------------------------------------------

pub(crate) async fn storage_finished(
    State(st): State<Arc<AppState>>,
    Json(req): Json<SignalRequest>,
) -> impl IntoResponse {
    st.correlator.on_completion_signal(&req.message);
    (
        StatusCode::ACCEPTED,
        Json(SignalAccepted {
            accepted: true,
            token: completion_token(&req.message).map(str::to_string),
        }),
    )
}

pub(crate) async fn storage_consistency_error(
    State(st): State<Arc<AppState>>,
    Json(req): Json<SignalRequest>,
) -> impl IntoResponse {
    st.correlator.on_consistency_error(&req.message);
    (
        StatusCode::ACCEPTED,
        Json(SignalAccepted {
            accepted: true,
            token: None,
        }),
    )
}
