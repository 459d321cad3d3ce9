//! Shared runtime state for tgw-daemon.
//!
//! All fields are `Arc` handles or cheap clones. Handlers receive
//! `State<Arc<AppState>>` from Axum.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tgw_config::GatewayConfig;
use tgw_correlator::{
    Clock, ConsistencyClassifier, CorrelatorSettings, DiagnosticLog, Storage, SystemClock,
    WriteCorrelator,
};
use tgw_schemas::StorageSignal;

use crate::devices::{DeviceDescription, DeviceSource, StoreBackedDevices};
use crate::hub::EventFanoutHub;
use crate::storage::SimulatedStore;

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: String,
    pub version: String,
}

impl BuildInfo {
    fn current() -> Self {
        Self {
            service: "tgw-daemon".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub build: BuildInfo,
    /// Hash of the configuration in effect; empty when built in code.
    pub config_hash: String,
    /// Request / notification / write streams and consistency counters.
    pub log: Arc<DiagnosticLog>,
    pub correlator: Arc<WriteCorrelator>,
    pub devices: Arc<StoreBackedDevices>,
    pub hub: EventFanoutHub,
}

impl AppState {
    pub fn new(cfg: &GatewayConfig, storage: Arc<dyn Storage>) -> Self {
        Self::with_clock(cfg, storage, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: &GatewayConfig, storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        let log = Arc::new(DiagnosticLog::new());
        let prefixes = &cfg.consistency.prefixes;
        let correlator = Arc::new(
            WriteCorrelator::new(storage, Arc::clone(&log))
                .with_clock(Arc::clone(&clock))
                .with_classifier(ConsistencyClassifier::new(
                    prefixes.local_detection.clone(),
                    prefixes.global_concurrent_write.clone(),
                    prefixes.not_persisted.clone(),
                ))
                .with_settings(CorrelatorSettings {
                    pending_timeout: cfg.correlator.pending_timeout(),
                    expired_memory: cfg.correlator.expired_memory,
                }),
        );

        let devices = Arc::new(StoreBackedDevices::new(
            cfg.devices.iter().map(DeviceDescription::from),
            Arc::clone(&correlator),
        ));
        let source: Arc<dyn DeviceSource> = devices.clone();
        let hub = EventFanoutHub::new(source, Arc::clone(&log), clock, cfg.liveness.interval());

        Self {
            build: BuildInfo::current(),
            config_hash: String::new(),
            log,
            correlator,
            devices,
            hub,
        }
    }

    /// State over an in-memory [`SimulatedStore`] seeded with each device's
    /// initial property values. The receiver must be pumped into the
    /// correlator (see [`spawn_signal_pump`]).
    pub fn simulated(
        cfg: &GatewayConfig,
    ) -> (Self, Arc<SimulatedStore>, mpsc::UnboundedReceiver<StorageSignal>) {
        let (store, signals) = SimulatedStore::new(&cfg.storage, cfg.consistency.prefixes.clone());
        for device in &cfg.devices {
            for (name, value) in &device.properties {
                store.seed(&device.id, name, value.clone());
            }
        }
        let store = Arc::new(store);
        let storage: Arc<dyn Storage> = store.clone();
        (Self::new(cfg, storage), store, signals)
    }

    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Forward store signals into the correlator until the store goes away.
pub fn spawn_signal_pump(
    correlator: Arc<WriteCorrelator>,
    mut signals: mpsc::UnboundedReceiver<StorageSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            debug!(?signal, "storage signal");
            correlator.handle_signal(&signal);
        }
        info!("storage signal channel closed");
    })
}
