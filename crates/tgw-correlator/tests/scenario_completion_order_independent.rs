//! A delayed write resolves exactly once whether the store's completion
//! signal arrives before or after its acknowledgment.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;

use tgw_correlator::{DiagnosticLog, ManualClock, Storage, StorageError, WriteCorrelator, WriteError};
use tgw_schemas::{Statement, StorageAck, WriteInterval};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

enum Step {
    Ack(StorageAck),
    /// Acknowledge only once the gate is released.
    Gated(StorageAck, oneshot::Receiver<()>),
    Fail(StorageError),
}

/// Store double that replays scripted acknowledgments in order.
#[derive(Default)]
struct ScriptedStorage {
    steps: Mutex<VecDeque<Step>>,
    executed: Mutex<Vec<Statement>>,
}

impl ScriptedStorage {
    fn with(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            executed: Mutex::new(Vec::new()),
        })
    }
}

impl Storage for ScriptedStorage {
    fn execute(&self, statement: Statement) -> BoxFuture<'_, Result<StorageAck, StorageError>> {
        self.executed.lock().push(statement);
        let step = self.steps.lock().pop_front();
        async move {
            match step {
                Some(Step::Ack(ack)) => Ok(ack),
                Some(Step::Gated(ack, gate)) => {
                    let _ = gate.await;
                    Ok(ack)
                }
                Some(Step::Fail(err)) => Err(err),
                None => Ok(StorageAck::applied()),
            }
        }
        .boxed()
    }
}

fn correlator(storage: Arc<ScriptedStorage>, clock: Arc<ManualClock>) -> Arc<WriteCorrelator> {
    Arc::new(WriteCorrelator::new(storage, Arc::new(DiagnosticLog::new())).with_clock(clock))
}

async fn wait_pending(c: &WriteCorrelator, token: &str) {
    while !c.pending_tokens().iter().any(|t| t == token) {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plain_ack_resolves_without_touching_delay_counter() {
    let clock = Arc::new(ManualClock::new(1_000));
    let c = correlator(ScriptedStorage::with(vec![Step::Ack(StorageAck::applied())]), clock);

    let ack = c.write("lamp", "level", json!(3)).await.unwrap();
    assert!(!ack.was_delayed());
    assert_eq!(ack.interval, WriteInterval::closed(1_000, 1_000));

    let snap = c.log().snapshot();
    assert_eq!(snap.db_writes, vec![json!(3)]);
    assert_eq!(snap.intervals.len(), 1);
    assert_eq!(snap.counters.delayed_requests, 0);
}

#[tokio::test]
async fn signal_after_ack_resumes_the_suspended_writer() {
    let clock = Arc::new(ManualClock::new(100));
    let c = correlator(
        ScriptedStorage::with(vec![Step::Ack(StorageAck::delayed("tok-1"))]),
        Arc::clone(&clock),
    );

    let writer = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.write("lamp", "level", json!(7)).await })
    };
    wait_pending(&c, "tok-1").await;
    assert!(c.finished_markers().is_empty());

    clock.set(150);
    c.on_completion_signal("batch applied tok-1");

    let ack = writer.await.unwrap().unwrap();
    assert_eq!(ack.token.as_deref(), Some("tok-1"));
    assert_eq!(ack.interval, WriteInterval::closed(100, 150));
    assert!(c.pending_tokens().is_empty());

    let snap = c.log().snapshot();
    assert_eq!(snap.intervals, vec![WriteInterval::closed(100, 150)]);
    assert_eq!(snap.counters.delayed_requests, 1);
}

#[tokio::test]
async fn signal_before_ack_resolves_immediately() {
    let clock = Arc::new(ManualClock::new(10));
    let c = correlator(
        ScriptedStorage::with(vec![Step::Ack(StorageAck::delayed("tok-2"))]),
        clock,
    );

    c.on_completion_signal("ctx tok-2");
    assert_eq!(c.finished_markers(), vec!["tok-2".to_string()]);

    let ack = c.write("lamp", "on", json!(true)).await.unwrap();
    assert_eq!(ack.token.as_deref(), Some("tok-2"));
    assert!(c.finished_markers().is_empty(), "marker consumed by the write");
    assert!(c.pending_tokens().is_empty(), "writer never suspended");
    assert_eq!(c.log().snapshot().intervals.len(), 1);
}

#[tokio::test]
async fn signal_while_store_call_in_flight_is_remembered() {
    let (release, gate) = oneshot::channel();
    let clock = Arc::new(ManualClock::new(0));
    let storage = ScriptedStorage::with(vec![Step::Gated(StorageAck::delayed("tok-3"), gate)]);
    let c = correlator(Arc::clone(&storage), clock);

    let writer = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.write("lamp", "level", json!(1)).await })
    };
    while storage.executed.lock().is_empty() {
        tokio::task::yield_now().await;
    }

    c.on_completion_signal("ctx tok-3");
    release.send(()).unwrap();

    let ack = writer.await.unwrap().unwrap();
    assert_eq!(ack.token.as_deref(), Some("tok-3"));
    assert!(c.finished_markers().is_empty());
    assert!(c.pending_tokens().is_empty());
}

#[tokio::test]
async fn repeated_signal_never_resolves_twice() {
    let clock = Arc::new(ManualClock::new(0));
    let c = correlator(
        ScriptedStorage::with(vec![Step::Ack(StorageAck::delayed("tok-4"))]),
        clock,
    );

    let writer = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.write("lamp", "level", json!(2)).await })
    };
    wait_pending(&c, "tok-4").await;

    c.on_completion_signal("ctx tok-4");
    c.on_completion_signal("ctx tok-4");
    c.on_completion_signal("ctx tok-4");

    writer.await.unwrap().unwrap();
    assert_eq!(
        c.log().snapshot().intervals.len(),
        1,
        "one resolution, one interval"
    );
    // Repeats for a resolved token leave nothing behind.
    assert!(c.finished_markers().is_empty());
    assert!(c.pending_tokens().is_empty());
}

#[tokio::test]
async fn repeat_after_early_resolution_leaves_no_marker() {
    let clock = Arc::new(ManualClock::new(0));
    let c = correlator(
        ScriptedStorage::with(vec![Step::Ack(StorageAck::delayed("tok-6"))]),
        clock,
    );

    c.on_completion_signal("ctx tok-6");
    let ack = c.write("lamp", "level", json!(6)).await.unwrap();
    assert_eq!(ack.token.as_deref(), Some("tok-6"));

    for _ in 0..5 {
        c.on_completion_signal("ctx tok-6");
    }
    assert!(c.finished_markers().is_empty());
    assert_eq!(c.log().snapshot().intervals.len(), 1);
}

#[tokio::test]
async fn resolution_follows_signal_order_not_write_order() {
    let clock = Arc::new(ManualClock::new(0));
    let c = correlator(
        ScriptedStorage::with(vec![
            Step::Ack(StorageAck::delayed("a")),
            Step::Ack(StorageAck::delayed("b")),
        ]),
        Arc::clone(&clock),
    );

    let first = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.write("lamp", "level", json!(0)).await })
    };
    wait_pending(&c, "a").await;
    clock.set(5);
    let second = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.write("lamp", "level", json!(1)).await })
    };
    wait_pending(&c, "b").await;

    clock.set(20);
    c.on_completion_signal("ctx b");
    let b = second.await.unwrap().unwrap();
    assert_eq!(c.pending_tokens(), vec!["a".to_string()]);

    clock.set(30);
    c.on_completion_signal("ctx a");
    let a = first.await.unwrap().unwrap();

    assert_eq!(a.interval, WriteInterval::closed(0, 30));
    assert_eq!(b.interval, WriteInterval::closed(5, 20));
    // Intervals are appended at resolution time.
    assert_eq!(c.log().snapshot().intervals, vec![b.interval, a.interval]);
}

#[tokio::test]
async fn storage_failure_is_an_absent_result() {
    let clock = Arc::new(ManualClock::new(0));
    let c = correlator(
        ScriptedStorage::with(vec![Step::Fail(StorageError::Unavailable(
            "node down".into(),
        ))]),
        clock,
    );

    let err = c.write("lamp", "level", json!(9)).await.unwrap_err();
    assert!(matches!(err, WriteError::Storage(StorageError::Unavailable(_))));

    let snap = c.log().snapshot();
    assert_eq!(snap.db_writes, vec![json!(9)], "value logged before the call");
    assert!(snap.intervals.is_empty());
}

#[tokio::test]
async fn reissued_pending_token_is_refused() {
    let clock = Arc::new(ManualClock::new(0));
    let c = correlator(
        ScriptedStorage::with(vec![
            Step::Ack(StorageAck::delayed("dup")),
            Step::Ack(StorageAck::delayed("dup")),
        ]),
        clock,
    );

    let first = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.write("lamp", "level", json!(0)).await })
    };
    wait_pending(&c, "dup").await;

    let err = c.write("lamp", "level", json!(1)).await.unwrap_err();
    assert_eq!(err, WriteError::DuplicateToken("dup".into()));

    c.on_completion_signal("ctx dup");
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn read_returns_first_row_value_or_none() {
    let clock = Arc::new(ManualClock::new(0));
    let c = correlator(
        ScriptedStorage::with(vec![
            Step::Ack(StorageAck::with_rows(vec![json!({"value": 42})])),
            Step::Fail(StorageError::Rejected("bad".into())),
        ]),
        clock,
    );

    assert_eq!(c.read("lamp", "level").await, Some(json!(42)));
    assert_eq!(c.read("lamp", "level").await, None);
}
