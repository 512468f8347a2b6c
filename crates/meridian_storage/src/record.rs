//! Versioned on-disk record.

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use meridian_runtime::ExecutionResult;
use serde::{Deserialize, Serialize};

/// Version written by this build
pub const RECORD_VERSION: u32 = 1;

/// Envelope around a persisted result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Record format version
    pub version: u32,
    /// When the record was written
    pub saved_at: DateTime<Utc>,
    /// The persisted result
    pub result: ExecutionResult,
}

impl StoredRecord {
    /// Wrap a result at the current version
    #[must_use]
    pub fn new(result: ExecutionResult) -> Self {
        Self {
            version: RECORD_VERSION,
            saved_at: Utc::now(),
            result,
        }
    }

    /// Encode to bytes
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from bytes, checking the version
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are malformed or from another version
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        // The version leads the encoding, so it can be checked before the body.
        let (version, _) = postcard::take_from_bytes::<u32>(bytes)?;
        if version != RECORD_VERSION {
            return Err(StorageError::VersionMismatch {
                expected: RECORD_VERSION,
                actual: version,
            });
        }
        Ok(postcard::from_bytes(bytes)?)
    }
}
