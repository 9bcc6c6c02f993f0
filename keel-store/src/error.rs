//! Error types for the store crate.

/// Errors raised while opening, using or closing a database session.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DatabaseError {
    /// Connecting failed, or the connection never became ready.
    #[error("failed to connect to {target}: {reason}")]
    Connection { target: String, reason: String },

    /// Tearing the connection down failed.
    #[error("failed to disconnect from {target}: {reason}")]
    Disconnect { target: String, reason: String },

    /// A driver error raised while the session was in use.
    #[error(transparent)]
    Driver(#[from] sqlx::Error),
}

/// Errors raised by a [`crate::BlobStore`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BlobError {
    /// No object exists at the given logical path.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The logical path is empty or escapes the container.
    #[error("invalid blob path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Stored object metadata could not be encoded or decoded.
    #[error("blob metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
