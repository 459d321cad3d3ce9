use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed configuration consumed by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub liveness: LivenessConfig,
    pub correlator: CorrelatorConfig,
    pub consistency: ConsistencyConfig,
    pub storage: StorageConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8088".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Upper bound on how long a delayed write waits for its completion
    /// signal. Absent = wait indefinitely.
    pub pending_timeout_ms: Option<u64>,
    /// How many expired and resolved tokens are remembered so late or
    /// repeated signals can be dropped.
    pub expired_memory: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            pending_timeout_ms: None,
            expired_memory: 1024,
        }
    }
}

impl CorrelatorConfig {
    pub fn pending_timeout(&self) -> Option<Duration> {
        self.pending_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub prefixes: ConsistencyPrefixes,
}

/// Message prefixes that route a `consistency-error` signal to its counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyPrefixes {
    pub local_detection: String,
    pub global_concurrent_write: String,
    pub not_persisted: String,
}

impl Default for ConsistencyPrefixes {
    fn default() -> Self {
        Self {
            local_detection: "LOCAL".to_string(),
            global_concurrent_write: "GLOBAL".to_string(),
            not_persisted: "NOT_PERSISTED".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Immediate,
    Delayed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,
    pub apply_delay_ms: u64,
    /// Serve the previously applied value while a delayed write is pending.
    pub stale_reads: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Immediate,
            apply_delay_ms: 50,
            stale_reads: false,
        }
    }
}

impl StorageConfig {
    pub fn apply_delay(&self) -> Duration {
        Duration::from_millis(self.apply_delay_ms)
    }
}

/// A device known to the gateway at boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Property name -> initial value.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}
