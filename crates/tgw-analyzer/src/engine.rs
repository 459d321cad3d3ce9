use std::collections::BTreeSet;

use serde_json::Value;
use tgw_schemas::{DiagnosticSnapshot, Millis, RequestRecord, WriteInterval};

use crate::{
    AnomalyReport, Classification, ClassificationSummary, ReconciledRequest, TimingSummary,
};

/// Arithmetic mean of `t[i+1] - t[i]`. Zero for fewer than two samples.
pub fn mean_consecutive_delta(times: &[Millis]) -> f64 {
    if times.len() < 2 {
        return 0.0;
    }
    let total: i64 = times.windows(2).map(|w| w[1] - w[0]).sum();
    total as f64 / (times.len() - 1) as f64
}

/// Integers of `[0, expected)` that never appear in the write log.
///
/// Non-integer log entries are ignored.
pub fn lost_values(db_writes: &[Value], expected: usize) -> Vec<i64> {
    let written: BTreeSet<i64> = db_writes.iter().filter_map(Value::as_i64).collect();
    (0..expected as i64)
        .filter(|v| !written.contains(v))
        .collect()
}

/// Pairs `(j, i)`, `j` created before `i`, where `i` finished strictly
/// before `j`.
///
/// Creation order is start order; intervals are recorded at resolution, so
/// they are re-sorted by start (stable) first. O(n²) over a bounded run.
pub fn overlap_count(intervals: &[WriteInterval]) -> usize {
    let mut by_start: Vec<WriteInterval> = intervals.to_vec();
    by_start.sort_by_key(|iv| iv.start);

    let mut count = 0;
    for i in 0..by_start.len() {
        for j in 0..i {
            if by_start[i].finish < by_start[j].finish {
                count += 1;
            }
        }
    }
    count
}

fn mean(samples: &[Millis]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<i64>() as f64 / samples.len() as f64
}

fn is_lost(req: &RequestRecord, lost: &BTreeSet<i64>) -> bool {
    req.value.as_i64().is_some_and(|v| lost.contains(&v))
}

/// Reconcile a recorded run.
///
/// Requests and notifications are walked with two cursors that normally
/// advance together:
/// - lost request value: only the request cursor advances;
/// - no notification left: `Unobserved`, only the request cursor advances;
/// - values differ: `StaleDatabaseRead` if the request value equals the raw
///   write-log entry at the notification cursor, else `ReorderedByGateway`;
/// - values equal: `Correct`.
pub fn analyze(snapshot: &DiagnosticSnapshot) -> AnomalyReport {
    let requests = &snapshot.requests;
    let notifications = &snapshot.notifications;

    let lost_list = lost_values(&snapshot.db_writes, requests.len());
    let lost: BTreeSet<i64> = lost_list.iter().copied().collect();

    let mut summary = ClassificationSummary::default();
    let mut reconciled: Vec<ReconciledRequest> = Vec::with_capacity(requests.len());
    let mut latencies: Vec<Millis> = Vec::new();

    let mut n = 0usize;
    for (r, req) in requests.iter().enumerate() {
        let request_lost = is_lost(req, &lost);
        let paired = if request_lost {
            None
        } else {
            notifications.get(n)
        };

        let classification = match paired {
            None if request_lost => Classification::Lost,
            None => Classification::Unobserved,
            Some(notif) if notif.value == req.value => Classification::Correct,
            Some(_) if snapshot.db_writes.get(n) == Some(&req.value) => {
                Classification::StaleDatabaseRead
            }
            Some(_) => Classification::ReorderedByGateway,
        };

        let latency = paired.map(|notif| notif.time - req.time);
        if let Some(l) = latency {
            latencies.push(l);
        }
        if paired.is_some() {
            n += 1;
        }

        summary.count(classification);
        reconciled.push(ReconciledRequest {
            index: r,
            request_value: req.value.clone(),
            request_time: req.time,
            notification_value: paired.map(|notif| notif.value.clone()),
            latency_ms: latency,
            classification,
        });
    }

    let notification_times: Vec<Millis> = notifications.iter().map(|n| n.time).collect();
    let mut write_starts: Vec<Millis> = snapshot.intervals.iter().map(|iv| iv.start).collect();
    write_starts.sort_unstable();

    AnomalyReport {
        summary,
        timings: TimingSummary {
            avg_notification_interval_ms: mean_consecutive_delta(&notification_times),
            avg_write_interval_ms: mean_consecutive_delta(&write_starts),
            avg_processing_latency_ms: mean(&latencies),
        },
        overlap_count: overlap_count(&snapshot.intervals),
        lost_values: lost_list,
        counters: snapshot.counters,
        requests: reconciled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mean_of_too_few_samples_is_zero() {
        assert_eq!(mean_consecutive_delta(&[]), 0.0);
        assert_eq!(mean_consecutive_delta(&[42]), 0.0);
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn lost_values_ignores_non_integers() {
        let log = vec![json!(0), json!("x"), json!(2.5), json!(2)];
        assert_eq!(lost_values(&log, 3), vec![1]);
    }

    #[test]
    fn overlap_is_zero_for_nested_in_order_finishes() {
        let ivs = [
            WriteInterval::closed(0, 10),
            WriteInterval::closed(1, 11),
            WriteInterval::closed(2, 12),
        ];
        assert_eq!(overlap_count(&ivs), 0);
    }
}
