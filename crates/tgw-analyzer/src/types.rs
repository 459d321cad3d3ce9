use serde::{Deserialize, Serialize};
use serde_json::Value;
use tgw_schemas::{ConsistencyErrorCounters, Millis};

/// Outcome for one recorded request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Notified value matches the request.
    Correct,
    /// The value never reached storage.
    Lost,
    /// Notified value differs; the store served an older value.
    StaleDatabaseRead,
    /// Notified value differs; the gateway delivered out of order.
    ReorderedByGateway,
    /// Stored, but no notification is left to pair it with.
    Unobserved,
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Correct => "correct",
            Classification::Lost => "lost",
            Classification::StaleDatabaseRead => "stale database read",
            Classification::ReorderedByGateway => "reordered by gateway",
            Classification::Unobserved => "unobserved",
        }
    }
}

/// One request after reconciliation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRequest {
    pub index: usize,
    pub request_value: Value,
    pub request_time: Millis,
    /// The notification this request was paired with, if any.
    pub notification_value: Option<Value>,
    pub latency_ms: Option<Millis>,
    pub classification: Classification,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub correct: usize,
    pub lost: usize,
    pub stale_database_read: usize,
    pub reordered_by_gateway: usize,
    pub unobserved: usize,
}

impl ClassificationSummary {
    pub fn count(&mut self, c: Classification) {
        let slot = match c {
            Classification::Correct => &mut self.correct,
            Classification::Lost => &mut self.lost,
            Classification::StaleDatabaseRead => &mut self.stale_database_read,
            Classification::ReorderedByGateway => &mut self.reordered_by_gateway,
            Classification::Unobserved => &mut self.unobserved,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.correct
            + self.lost
            + self.stale_database_read
            + self.reordered_by_gateway
            + self.unobserved
    }

    pub fn is_clean(&self) -> bool {
        self.total() == self.correct
    }
}

/// Averages in milliseconds. Zero when there are too few samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub avg_notification_interval_ms: f64,
    pub avg_write_interval_ms: f64,
    pub avg_processing_latency_ms: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub summary: ClassificationSummary,
    pub timings: TimingSummary,
    /// Later-created writes that finished before an earlier-created one.
    pub overlap_count: usize,
    /// Values of `[0, N)` absent from the storage write log, ascending.
    pub lost_values: Vec<i64>,
    pub counters: ConsistencyErrorCounters,
    pub requests: Vec<ReconciledRequest>,
}

impl AnomalyReport {
    pub fn classification_of(&self, index: usize) -> Option<Classification> {
        self.requests.get(index).map(|r| r.classification)
    }
}
