use futures_util::future::BoxFuture;
use tgw_schemas::{Statement, StorageAck};

/// Failure of a single `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("statement rejected: {0}")]
    Rejected(String),
}

/// The backing store as seen by the correlator.
///
/// Completion signals for delayed acknowledgments are delivered separately
/// (see [`crate::WriteCorrelator::on_completion_signal`]); this trait only
/// covers the request/acknowledgment half of the contract.
pub trait Storage: Send + Sync {
    fn execute(&self, statement: Statement) -> BoxFuture<'_, Result<StorageAck, StorageError>>;
}
