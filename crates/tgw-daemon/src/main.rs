//! tgw-daemon entry point.
//!
//! Thin on purpose: load configuration, set up tracing, build the shared
//! state, wire middleware, and start the HTTP server. Route handlers live in
//! `routes.rs`; shared state types live in `state.rs`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tgw_config::{report_unused_keys, UnusedKeyPolicy};
use tgw_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "tgw-daemon")]
#[command(about = "Things gateway consistency daemon", long_about = None)]
struct Args {
    /// YAML config layers in merge order (base -> env -> local ...)
    #[arg(long = "config")]
    config: Vec<PathBuf>,

    /// Listen address; overrides `server.addr` and TGW_DAEMON_ADDR.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Refuse to start when the config carries keys nothing reads.
    #[arg(long, default_value_t = false)]
    strict_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; silent when the file does not exist.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let args = Args::parse();

    let paths: Vec<String> = args
        .config
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = tgw_config::load_layered_yaml(&path_refs)?;

    let policy = if args.strict_config {
        UnusedKeyPolicy::Fail
    } else {
        UnusedKeyPolicy::Warn
    };
    let report = report_unused_keys(&loaded.config_json, policy)?;
    for pointer in &report.unused_leaf_pointers {
        warn!(pointer = %pointer, "CONFIG_UNUSED_KEYS");
    }

    let cfg = loaded.gateway()?;
    info!(
        config_hash = %loaded.config_hash,
        devices = cfg.devices.len(),
        storage_mode = ?cfg.storage.mode,
        "config loaded"
    );

    let (app_state, _store, signals) = state::AppState::simulated(&cfg);
    let shared = Arc::new(app_state.with_config_hash(loaded.config_hash.clone()));

    state::spawn_signal_pump(Arc::clone(&shared.correlator), signals);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = match args.addr.or_else(bind_addr_from_env) {
        Some(addr) => addr,
        None => cfg
            .server
            .addr
            .parse()
            .with_context(|| format!("invalid server.addr: {}", cfg.server.addr))?,
    };
    info!("tgw-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("TGW_DAEMON_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:8080",
        "http://127.0.0.1:8080",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::PUT, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
