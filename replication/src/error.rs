use storage::StoreError;
use thiserror::Error;

pub type ReplicationResult<T> = Result<T, ReplicationError>;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Consensus engine rejected the operation: {0}")]
    EngineError(String),

    #[error(transparent)]
    StoreError(#[from] StoreError),

    #[error("Persisted log entry failed to decode: {0}")]
    CorruptEntry(String),

    #[error("The replicator is not running")]
    Stopped,

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
}
