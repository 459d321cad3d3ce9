//! tgw-correlator
//!
//! Write-completion correlation against an eventually-consistent store.
//!
//! A write is acknowledged by the store either plainly (effect visible now)
//! or with a delay token. A delayed write is only complete once the store's
//! out-of-band `finished-processing` signal for that token arrives, and the
//! signal may arrive before or after the acknowledgment. [`WriteCorrelator`]
//! matches the two regardless of order and resolves every token at most once.
//!
//! [`DiagnosticLog`] holds the recorded request / notification / write
//! streams and the consistency error counters consumed by `tgw-analyzer`.

mod classify;
mod clock;
mod correlator;
mod recorder;
mod storage;

pub use classify::ConsistencyClassifier;
pub use clock::{Clock, ManualClock, SystemClock};
pub use correlator::{CorrelatorSettings, WriteAck, WriteCorrelator, WriteError};
pub use recorder::DiagnosticLog;
pub use storage::{Storage, StorageError};
