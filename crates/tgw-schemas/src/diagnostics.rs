use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Epoch milliseconds. All recorded streams share this clock.
pub type Millis = i64;

// ---------------------------------------------------------------------------
// Recorded streams
// ---------------------------------------------------------------------------

/// An inbound property-set request as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub value: Value,
    pub time: Millis,
}

impl RequestRecord {
    pub fn new(value: impl Into<Value>, time: Millis) -> Self {
        Self {
            value: value.into(),
            time,
        }
    }
}

/// A property-change notification pushed to a live subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub value: Value,
    pub time: Millis,
}

impl NotificationRecord {
    pub fn new(value: impl Into<Value>, time: Millis) -> Self {
        Self {
            value: value.into(),
            time,
        }
    }
}

/// Round trip of one storage write, from statement issue to resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteInterval {
    pub start: Millis,
    pub finish: Millis,
}

impl WriteInterval {
    /// Close an interval. A clock that stepped backwards never yields
    /// `finish < start`.
    pub fn closed(start: Millis, finish: Millis) -> Self {
        Self {
            start,
            finish: finish.max(start),
        }
    }

    pub fn duration_ms(&self) -> Millis {
        self.finish - self.start
    }
}

// ---------------------------------------------------------------------------
// Consistency error counters
// ---------------------------------------------------------------------------

/// Which counter a storage-side consistency signal lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    LocalDetection,
    GlobalConcurrentWrite,
    NotPersisted,
    DelayedRequests,
}

/// Four independent tallies. Reset only together with the recorded streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyErrorCounters {
    pub local_detection: u64,
    pub global_concurrent_write: u64,
    pub not_persisted: u64,
    pub delayed_requests: u64,
}

impl ConsistencyErrorCounters {
    pub fn bump(&mut self, kind: CounterKind) {
        let slot = match kind {
            CounterKind::LocalDetection => &mut self.local_detection,
            CounterKind::GlobalConcurrentWrite => &mut self.global_concurrent_write,
            CounterKind::NotPersisted => &mut self.not_persisted,
            CounterKind::DelayedRequests => &mut self.delayed_requests,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn get(&self, kind: CounterKind) -> u64 {
        match kind {
            CounterKind::LocalDetection => self.local_detection,
            CounterKind::GlobalConcurrentWrite => self.global_concurrent_write,
            CounterKind::NotPersisted => self.not_persisted,
            CounterKind::DelayedRequests => self.delayed_requests,
        }
    }
}

// ---------------------------------------------------------------------------
// DiagnosticSnapshot
// ---------------------------------------------------------------------------

/// Owned, point-in-time copy of every recorded stream plus the counters.
///
/// Taken under a single lock so the streams are mutually consistent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    pub requests: Vec<RequestRecord>,
    pub notifications: Vec<NotificationRecord>,
    /// Raw values in the order they were submitted to storage.
    pub db_writes: Vec<Value>,
    /// Resolved write intervals in creation order.
    pub intervals: Vec<WriteInterval>,
    pub counters: ConsistencyErrorCounters,
}

impl DiagnosticSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
            && self.notifications.is_empty()
            && self.db_writes.is_empty()
            && self.intervals.is_empty()
            && self.counters == ConsistencyErrorCounters::default()
    }
}
