//! Error types for peerstate

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// peerstate core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Hash mismatch (computed != transmitted address)
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Malformed node address
    #[error("invalid node address: {0}")]
    InvalidAddress(String),

    /// Malformed content hash
    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    /// Repeated field ordering violation
    #[error("repeated field not sorted/deduped: {field}")]
    UnsortedRepeatedField { field: String },
}
