//! In-memory eventually-consistent store used when the daemon runs without
//! an external backend.
//!
//! `immediate` mode applies and acknowledges every update in one step.
//! `delayed` mode acknowledges with a `DELAY <token>` warning, applies the
//! value after `apply_delay`, then emits `finished-processing`. With
//! `stale_reads` the old value stays visible until the apply; otherwise the
//! value is visible at once and only the confirmation is late.
//!
//! The store also reports the anomalies it can see on its own: a read that
//! races an outstanding delayed write (local detection) and two delayed
//! writes to the same key in flight together (global concurrent write).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use tgw_config::{ConsistencyPrefixes, StorageConfig, StorageMode};
use tgw_correlator::{Storage, StorageError};
use tgw_schemas::{Statement, StorageAck, StorageSignal};

type Key = (String, String);

#[derive(Default)]
struct StoreState {
    values: HashMap<Key, Value>,
    /// Delayed updates acknowledged but not yet applied, per key.
    outstanding: HashMap<Key, usize>,
}

pub struct SimulatedStore {
    mode: StorageMode,
    apply_delay: Duration,
    stale_reads: bool,
    prefixes: ConsistencyPrefixes,
    state: Arc<Mutex<StoreState>>,
    signals: mpsc::UnboundedSender<StorageSignal>,
}

impl SimulatedStore {
    /// The receiver carries `finished-processing` and `consistency-error`
    /// signals; pump it into the correlator.
    pub fn new(
        cfg: &StorageConfig,
        prefixes: ConsistencyPrefixes,
    ) -> (Self, mpsc::UnboundedReceiver<StorageSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let store = Self {
            mode: cfg.mode,
            apply_delay: cfg.apply_delay(),
            stale_reads: cfg.stale_reads,
            prefixes,
            state: Arc::new(Mutex::new(StoreState::default())),
            signals,
        };
        (store, rx)
    }

    /// Set a value directly, bypassing acknowledgments and signals.
    pub fn seed(&self, device_id: &str, property: &str, value: Value) {
        self.state
            .lock()
            .values
            .insert((device_id.to_string(), property.to_string()), value);
    }

    pub fn current(&self, device_id: &str, property: &str) -> Option<Value> {
        self.state
            .lock()
            .values
            .get(&(device_id.to_string(), property.to_string()))
            .cloned()
    }

    fn emit(&self, signal: StorageSignal) {
        // No receiver means nobody is correlating; nothing to do.
        let _ = self.signals.send(signal);
    }

    fn update(&self, key: Key, value: Value) -> StorageAck {
        if self.mode == StorageMode::Immediate {
            self.state.lock().values.insert(key, value);
            return StorageAck::applied();
        }

        let token = Uuid::new_v4().simple().to_string();
        let concurrent = {
            let mut st = self.state.lock();
            if !self.stale_reads {
                st.values.insert(key.clone(), value.clone());
            }
            let n = st.outstanding.entry(key.clone()).or_insert(0);
            *n += 1;
            *n > 1
        };
        if concurrent {
            self.emit(StorageSignal::ConsistencyError(format!(
                "{} concurrent write {}/{}",
                self.prefixes.global_concurrent_write, key.0, key.1
            )));
        }

        let state = Arc::clone(&self.state);
        let signals = self.signals.clone();
        let delay = self.apply_delay;
        let stale_reads = self.stale_reads;
        let context = format!("update {}/{}", key.0, key.1);
        let signal_token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut st = state.lock();
                if stale_reads {
                    st.values.insert(key.clone(), value);
                }
                if let Some(n) = st.outstanding.get_mut(&key) {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        st.outstanding.remove(&key);
                    }
                }
            }
            debug!(token = %signal_token, "delayed update applied");
            let _ = signals.send(StorageSignal::FinishedProcessing(format!(
                "{context} {signal_token}"
            )));
        });

        StorageAck::delayed(token)
    }

    fn select(&self, key: Key) -> StorageAck {
        let (value, racing) = {
            let st = self.state.lock();
            (
                st.values.get(&key).cloned(),
                st.outstanding.contains_key(&key),
            )
        };
        if racing && self.stale_reads {
            self.emit(StorageSignal::ConsistencyError(format!(
                "{} read raced pending write {}/{}",
                self.prefixes.local_detection, key.0, key.1
            )));
        }
        match value {
            Some(v) => StorageAck::with_rows(vec![json!({ "value": v })]),
            None => StorageAck::with_rows(Vec::new()),
        }
    }
}

impl Storage for SimulatedStore {
    fn execute(&self, statement: Statement) -> BoxFuture<'_, Result<StorageAck, StorageError>> {
        async move {
            let ack = match statement {
                Statement::Update {
                    device_id,
                    property,
                    value,
                } => self.update((device_id, property), value),
                Statement::Select {
                    device_id,
                    property,
                } => self.select((device_id, property)),
            };
            Ok(ack)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delayed(stale_reads: bool) -> (SimulatedStore, mpsc::UnboundedReceiver<StorageSignal>) {
        SimulatedStore::new(
            &StorageConfig {
                mode: StorageMode::Delayed,
                apply_delay_ms: 10,
                stale_reads,
            },
            ConsistencyPrefixes::default(),
        )
    }

    #[tokio::test]
    async fn immediate_update_is_visible_and_plain() {
        let (store, _rx) = SimulatedStore::new(&StorageConfig::default(), ConsistencyPrefixes::default());
        let ack = store
            .execute(Statement::update("lamp", "level", json!(4)))
            .await
            .unwrap();
        assert_eq!(ack.delay_token(), None);
        assert_eq!(store.current("lamp", "level"), Some(json!(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_update_signals_its_token() {
        let (store, mut rx) = delayed(true);
        store.seed("lamp", "level", json!(0));

        let ack = store
            .execute(Statement::update("lamp", "level", json!(1)))
            .await
            .unwrap();
        let token = ack.delay_token().unwrap().to_string();

        // Stale until applied, and the store notices the race.
        let read = store
            .execute(Statement::select("lamp", "level"))
            .await
            .unwrap();
        assert_eq!(read.first_value(), Some(&json!(0)));
        match rx.recv().await.unwrap() {
            StorageSignal::ConsistencyError(m) => assert!(m.starts_with("LOCAL")),
            other => panic!("unexpected {other:?}"),
        }

        match rx.recv().await.unwrap() {
            StorageSignal::FinishedProcessing(m) => assert!(m.ends_with(&token)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.current("lamp", "level"), Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_delayed_updates_report_global_conflict() {
        let (store, mut rx) = delayed(false);
        store
            .execute(Statement::update("lamp", "level", json!(1)))
            .await
            .unwrap();
        store
            .execute(Statement::update("lamp", "level", json!(2)))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            StorageSignal::ConsistencyError(m) => assert!(m.starts_with("GLOBAL")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.current("lamp", "level"), Some(json!(2)));
    }
}
