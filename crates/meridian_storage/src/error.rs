//! Storage errors.

/// State store error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database could not be opened or accessed
    #[error("State database error: {0}")]
    Database(String),

    /// Record bytes could not be encoded or decoded
    #[error("State record encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    /// Record was written by an incompatible version
    #[error("Unsupported state record version: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this build reads
        expected: u32,
        /// Version found
        actual: u32,
    },

    /// Filesystem error
    #[error("State path error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn database(err: impl Into<redb::Error>) -> Self {
        Self::Database(err.into().to_string())
    }
}
