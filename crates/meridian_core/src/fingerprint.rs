//! Content fingerprints of declared nodes.
//!
//! Uses BLAKE3 over a length-prefixed encoding of kind, attributes and
//! references. Attribute maps are ordered, so identical declarations always
//! produce identical fingerprints.

use crate::resource::ResourceNode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A BLAKE3 digest of a node's declared content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a node
    #[must_use]
    pub fn of(node: &ResourceNode) -> Self {
        let mut hasher = blake3::Hasher::new();
        write_field(&mut hasher, node.kind.as_str().as_bytes());

        hasher.update(&(node.attributes.len() as u64).to_le_bytes());
        for (key, value) in &node.attributes {
            write_field(&mut hasher, key.as_bytes());
            write_field(&mut hasher, value.to_string().as_bytes());
        }

        hasher.update(&(node.references.len() as u64).to_le_bytes());
        for reference in &node.references {
            write_field(&mut hasher, reference.as_str().as_bytes());
        }

        Self(*hasher.finalize().as_bytes())
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// # Errors
    ///
    /// Returns error if hex is invalid or not 32 bytes
    pub fn from_hex(hex: &str) -> Result<Self, FingerprintError> {
        let bytes = hex::decode(hex).map_err(|_| FingerprintError::InvalidHex)?;
        if bytes.len() != 32 {
            return Err(FingerprintError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short prefix for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

fn write_field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Fingerprint parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    /// Invalid hex encoding
    #[error("Invalid hex encoding")]
    InvalidHex,
    /// Invalid length (not 32 bytes)
    #[error("Invalid fingerprint length: {0} bytes")]
    InvalidLength(usize),
}
