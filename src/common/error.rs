//! Error types for lockstep

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Unknown or unopened namespace: {0}")]
    UnknownUser(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Binlog slot {0} out of range")]
    SlotOutOfRange(i64),

    // === Raft Errors ===
    #[error("Not leader: current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Leader is in safe mode")]
    SafeMode,

    #[error("Too many pending writes")]
    Busy,

    #[error("Session uuid is expired or unknown")]
    UuidExpired,

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Busy | Error::NotLeader(_)
        )
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
