use serde_json::Value;

use crate::AnomalyReport;

/// Plain-text diagnostic report.
///
/// Summary counts, average timings, overlap count, consistency counters,
/// then one annotated line per reconciled request.
pub fn render_text(report: &AnomalyReport) -> String {
    let s = &report.summary;
    let t = &report.timings;
    let c = &report.counters;

    let mut lines = vec![
        format!("requests: {}", s.total()),
        format!("correct: {}", s.correct),
        format!("lost: {}", s.lost),
        format!("stale database read: {}", s.stale_database_read),
        format!("reordered by gateway: {}", s.reordered_by_gateway),
        format!("unobserved: {}", s.unobserved),
        format!(
            "average notification interval ms: {:.2}",
            t.avg_notification_interval_ms
        ),
        format!("average write interval ms: {:.2}", t.avg_write_interval_ms),
        format!(
            "average processing latency ms: {:.2}",
            t.avg_processing_latency_ms
        ),
        format!("overlapping writes: {}", report.overlap_count),
        format!("local consistency errors: {}", c.local_detection),
        format!("global concurrent write errors: {}", c.global_concurrent_write),
        format!("not persisted errors: {}", c.not_persisted),
        format!("delayed requests: {}", c.delayed_requests),
        "---".to_string(),
    ];

    for r in &report.requests {
        let mut line = format!(
            "#{} value={} -> {}",
            r.index,
            compact(&r.request_value),
            r.classification.label()
        );
        if let Some(v) = &r.notification_value {
            line.push_str(&format!(" notified={}", compact(v)));
        }
        if let Some(l) = r.latency_ms {
            line.push_str(&format!(" latency_ms={l}"));
        }
        lines.push(line);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn compact(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
