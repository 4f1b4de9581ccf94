//! Error types for peersync

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::SiteId;

/// Main error type for peersync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer connection failed or was closed
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// The transport never acknowledged the channel as open
    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(SiteId),

    /// A change record failed validation
    #[error("Invalid change: {0}")]
    InvalidChange(String),

    /// A site id could not be parsed
    #[error("Invalid site id: {0}")]
    InvalidSiteId(String),

    /// The local store was closed before it became ready
    #[error("Local store is unavailable")]
    StoreUnavailable,

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration could not be loaded or is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<postcard::Error> for SyncError {
    fn from(err: postcard::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
