//! tgw-analyzer
//!
//! Consistency anomaly analysis over a recorded test run.
//!
//! Reconciles the request, notification and storage-write streams into
//! per-request classifications (correct / lost / stale database read /
//! reordered by gateway / unobserved) and timing statistics.
//!
//! Deterministic, pure logic. No IO. The caller takes the snapshot.
//!
//! Loss detection assumes the workload writes the dense integer range
//! `[0, N)`, N being the number of recorded requests. That holds for the
//! diagnostic load generator only; it is not a general loss detector.

mod engine;
mod render;
mod types;

pub use engine::{analyze, lost_values, mean_consecutive_delta, overlap_count};
pub use render::render_text;
pub use types::*;
