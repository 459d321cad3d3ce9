//! Write-completion correlation.
//!
//! # Token lifecycle
//!
//! A completion token lives in exactly one of two places:
//!
//! - `pending`: a delayed acknowledgment arrived first; a caller is
//!   suspended on a oneshot until the signal for the token shows up.
//! - `finished`: the signal arrived first; the token waits for the write
//!   whose acknowledgment will carry it.
//!
//! Whichever half arrives second removes the token and resolves the write.
//! The oneshot sender is consumed by resolution, so no token resolves twice.
//!
//! Tokens that left `pending` without resolving (expired, or the writer was
//! dropped) and tokens that already resolved are kept in bounded rings, so a
//! late or repeated signal for them is dropped rather than becoming a marker
//! nobody will ever claim.
//!
//! The table is only touched inside short synchronous critical sections that
//! never span an `.await`; each handler's transition is atomic with respect
//! to every other handler.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use tgw_schemas::{completion_token, CounterKind, Millis, Statement, StorageSignal, WriteInterval};

use crate::{Clock, ConsistencyClassifier, DiagnosticLog, Storage, StorageError, SystemClock};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    /// Bound on how long a delayed write waits for its signal. `None` waits
    /// forever.
    pub pending_timeout: Option<Duration>,
    /// Capacity of the expired and resolved rings. Late or repeated signals
    /// for a remembered token are dropped instead of turning into finished
    /// markers.
    pub expired_memory: usize,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            pending_timeout: None,
            expired_memory: 1024,
        }
    }
}

/// A write whose effect the store has confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteAck {
    pub interval: WriteInterval,
    /// Rows returned with the acknowledgment, if any.
    pub rows: Option<Vec<Value>>,
    /// Delay token, when the store acknowledged asynchronously.
    pub token: Option<String>,
}

impl WriteAck {
    pub fn was_delayed(&self) -> bool {
        self.token.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The store call itself failed. Callers treat this as an absent result.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The store issued a token that is already awaiting its signal.
    #[error("completion token {0} is already pending")]
    DuplicateToken(String),
    /// No completion signal within the configured bound.
    #[error("completion token {token} expired after {waited_ms} ms")]
    Expired { token: String, waited_ms: u64 },
    /// The pending entry went away without being resolved.
    #[error("completion token {0} was abandoned")]
    Abandoned(String),
}

// ---------------------------------------------------------------------------
// Correlation table
// ---------------------------------------------------------------------------

struct Pending {
    start: Millis,
    tx: oneshot::Sender<WriteInterval>,
}

#[derive(Default)]
struct CorrelationTable {
    pending: HashMap<String, Pending>,
    finished: VecDeque<String>,
    expired: VecDeque<String>,
    resolved: VecDeque<String>,
}

/// Push onto a ring holding at most `cap` tokens.
fn remember(ring: &mut VecDeque<String>, token: &str, cap: usize) {
    if cap == 0 {
        return;
    }
    if ring.len() >= cap {
        ring.pop_front();
    }
    ring.push_back(token.to_string());
}

/// Evicts the pending entry when the waiting writer is dropped before its
/// signal arrives. A no-op once the entry is gone.
struct EvictOnDrop<'a> {
    correlator: &'a WriteCorrelator,
    token: &'a str,
}

impl Drop for EvictOnDrop<'_> {
    fn drop(&mut self) {
        if self.correlator.expire(self.token) {
            info!(token = self.token, "writer dropped while pending; entry evicted");
        }
    }
}

enum Registration {
    /// Signal already seen; resolve now.
    AlreadyFinished,
    /// Wait on the receiver.
    Waiting(oneshot::Receiver<WriteInterval>),
}

// ---------------------------------------------------------------------------
// WriteCorrelator
// ---------------------------------------------------------------------------

pub struct WriteCorrelator {
    storage: Arc<dyn Storage>,
    log: Arc<DiagnosticLog>,
    clock: Arc<dyn Clock>,
    classifier: ConsistencyClassifier,
    settings: CorrelatorSettings,
    table: Mutex<CorrelationTable>,
}

impl WriteCorrelator {
    pub fn new(storage: Arc<dyn Storage>, log: Arc<DiagnosticLog>) -> Self {
        Self {
            storage,
            log,
            clock: Arc::new(SystemClock),
            classifier: ConsistencyClassifier::default(),
            settings: CorrelatorSettings::default(),
            table: Mutex::new(CorrelationTable::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_classifier(mut self, classifier: ConsistencyClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_settings(mut self, settings: CorrelatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn log(&self) -> &Arc<DiagnosticLog> {
        &self.log
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Issue an update for `device_id.property = value` and wait until the
    /// store confirms it took effect.
    ///
    /// The value is appended to the write log and the interval opened before
    /// the store is called. A delayed acknowledgment suspends the caller
    /// until [`Self::on_completion_signal`] sees the same token, unless that
    /// signal already arrived.
    pub async fn write(
        &self,
        device_id: &str,
        property: &str,
        value: Value,
    ) -> Result<WriteAck, WriteError> {
        let statement = Statement::update(device_id, property, value.clone());
        debug!(%statement, "write issued");

        self.log.record_db_write(value);
        let start = self.clock.now_millis();

        let ack = match self.storage.execute(statement).await {
            Ok(ack) => ack,
            Err(err) => {
                warn!(device_id, property, error = %err, "storage write failed");
                return Err(err.into());
            }
        };

        let Some(token) = ack.delay_token().map(str::to_owned) else {
            let interval = self.close_interval(start);
            return Ok(WriteAck {
                interval,
                rows: ack.rows,
                token: None,
            });
        };

        self.log.bump(CounterKind::DelayedRequests);

        let interval = match self.register(&token, start)? {
            Registration::AlreadyFinished => {
                debug!(token = %token, "signal preceded acknowledgment");
                self.close_interval(start)
            }
            Registration::Waiting(rx) => {
                let _evict = EvictOnDrop {
                    correlator: self,
                    token: &token,
                };
                self.await_completion(&token, rx).await?
            }
        };

        Ok(WriteAck {
            interval,
            rows: ack.rows,
            token: Some(token),
        })
    }

    /// Read the current value of `device_id.property` from the store.
    ///
    /// A failed read is logged and reported as `None`.
    pub async fn read(&self, device_id: &str, property: &str) -> Option<Value> {
        match self
            .storage
            .execute(Statement::select(device_id, property))
            .await
        {
            Ok(ack) => ack.first_value().cloned(),
            Err(err) => {
                warn!(device_id, property, error = %err, "storage read failed");
                None
            }
        }
    }

    /// The store reports that a delayed statement has taken effect.
    ///
    /// `message` is `"<context> <token>"`.
    pub fn on_completion_signal(&self, message: &str) {
        let Some(token) = completion_token(message) else {
            debug!(message, "completion signal without token dropped");
            return;
        };

        let resolved = {
            let mut table = self.table.lock();
            if let Some(pending) = table.pending.remove(token) {
                remember(&mut table.resolved, token, self.settings.expired_memory);
                Some(pending)
            } else {
                if let Some(pos) = table.expired.iter().position(|t| t == token) {
                    table.expired.remove(pos);
                    info!(token, "late completion signal for expired write dropped");
                } else if table.resolved.iter().any(|t| t == token) {
                    debug!(token, "repeat completion signal for resolved write dropped");
                } else if table.finished.iter().any(|t| t == token) {
                    debug!(token, "duplicate completion signal ignored");
                } else {
                    table.finished.push_back(token.to_string());
                }
                None
            }
        };

        if let Some(Pending { start, tx }) = resolved {
            let interval = self.close_interval(start);
            if tx.send(interval).is_err() {
                debug!(token, "writer gone before completion; interval kept");
            }
        }
    }

    /// The store reports a consistency anomaly. Tallied, never surfaced.
    pub fn on_consistency_error(&self, message: &str) {
        match self.classifier.classify(message) {
            Some(kind) => self.log.bump(kind),
            None => debug!(message, "unclassified consistency error dropped"),
        }
    }

    pub fn handle_signal(&self, signal: &StorageSignal) {
        match signal {
            StorageSignal::FinishedProcessing(message) => self.on_completion_signal(message),
            StorageSignal::ConsistencyError(message) => self.on_consistency_error(message),
        }
    }

    /// Tokens with a suspended writer, sorted.
    pub fn pending_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.table.lock().pending.keys().cloned().collect();
        tokens.sort();
        tokens
    }

    /// Tokens whose signal arrived before any writer, in arrival order.
    pub fn finished_markers(&self) -> Vec<String> {
        self.table.lock().finished.iter().cloned().collect()
    }

    /// Drop every marker and pending entry. Suspended writers fail with
    /// [`WriteError::Abandoned`]; their tokens move to the expired ring so a
    /// late signal is dropped. Returns the number of abandoned writers.
    pub fn reset(&self) -> usize {
        let mut table = self.table.lock();
        let abandoned: Vec<String> = table.pending.drain().map(|(token, _)| token).collect();
        table.finished.clear();
        table.expired.clear();
        table.resolved.clear();
        for token in &abandoned {
            remember(&mut table.expired, token, self.settings.expired_memory);
        }
        abandoned.len()
    }

    // -----------------------------------------------------------------------

    fn close_interval(&self, start: Millis) -> WriteInterval {
        let interval = WriteInterval::closed(start, self.clock.now_millis());
        self.log.record_interval(interval);
        interval
    }

    fn register(&self, token: &str, start: Millis) -> Result<Registration, WriteError> {
        let mut table = self.table.lock();
        if let Some(pos) = table.finished.iter().position(|t| t == token) {
            table.finished.remove(pos);
            remember(&mut table.resolved, token, self.settings.expired_memory);
            return Ok(Registration::AlreadyFinished);
        }
        if table.pending.contains_key(token) {
            warn!(token, "store reissued a pending completion token");
            return Err(WriteError::DuplicateToken(token.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        table.pending.insert(token.to_string(), Pending { start, tx });
        Ok(Registration::Waiting(rx))
    }

    async fn await_completion(
        &self,
        token: &str,
        mut rx: oneshot::Receiver<WriteInterval>,
    ) -> Result<WriteInterval, WriteError> {
        let Some(limit) = self.settings.pending_timeout else {
            return rx
                .await
                .map_err(|_| WriteError::Abandoned(token.to_string()));
        };

        match tokio::time::timeout(limit, &mut rx).await {
            Ok(res) => res.map_err(|_| WriteError::Abandoned(token.to_string())),
            Err(_) => {
                if self.expire(token) {
                    warn!(token, waited_ms = limit.as_millis() as u64, "pending write expired");
                    return Err(WriteError::Expired {
                        token: token.to_string(),
                        waited_ms: limit.as_millis() as u64,
                    });
                }
                // Resolved (or reset) between the deadline and taking the
                // lock; the sender is already consumed or dropped.
                rx.await
                    .map_err(|_| WriteError::Abandoned(token.to_string()))
            }
        }
    }

    /// Evict a pending entry. `false` if it was resolved in the meantime.
    fn expire(&self, token: &str) -> bool {
        let mut table = self.table.lock();
        if table.pending.remove(token).is_none() {
            return false;
        }
        remember(&mut table.expired, token, self.settings.expired_memory);
        true
    }
}
