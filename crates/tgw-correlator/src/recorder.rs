//! Recorded diagnostic streams and consistency error counters.
//!
//! Append-only while a test run is in progress. Every stream and counter
//! lives behind one lock so that `snapshot` and `reset` see or clear all of
//! them together.

use parking_lot::Mutex;
use serde_json::Value;
use tgw_schemas::{
    ConsistencyErrorCounters, CounterKind, DiagnosticSnapshot, Millis, NotificationRecord,
    RequestRecord, WriteInterval,
};

#[derive(Debug, Default)]
pub struct DiagnosticLog {
    inner: Mutex<DiagnosticSnapshot>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, value: Value, time: Millis) {
        self.inner
            .lock()
            .requests
            .push(RequestRecord { value, time });
    }

    pub fn record_notification(&self, value: Value, time: Millis) {
        self.inner
            .lock()
            .notifications
            .push(NotificationRecord { value, time });
    }

    pub fn record_db_write(&self, value: Value) {
        self.inner.lock().db_writes.push(value);
    }

    pub fn record_interval(&self, interval: WriteInterval) {
        self.inner.lock().intervals.push(interval);
    }

    pub fn bump(&self, kind: CounterKind) {
        self.inner.lock().counters.bump(kind);
    }

    pub fn counters(&self) -> ConsistencyErrorCounters {
        self.inner.lock().counters
    }

    pub fn snapshot(&self) -> DiagnosticSnapshot {
        self.inner.lock().clone()
    }

    /// Clear every stream and counter at once.
    ///
    /// Writes still in flight when this runs will append to the fresh log.
    pub fn reset(&self) {
        *self.inner.lock() = DiagnosticSnapshot::empty();
    }
}
