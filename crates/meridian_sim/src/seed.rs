//! Seed management for reproducible runs.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Where a seed came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedSource {
    /// A literal value
    Literal(u64),
    /// A label, hashed
    FromString(String),
}

impl SeedSource {
    /// Seed value
    #[must_use]
    pub fn to_seed(&self) -> u64 {
        match self {
            Self::Literal(seed) => *seed,
            Self::FromString(label) => hash_u64(&[label.as_bytes()]),
        }
    }
}

/// Seed for a simulated control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimSeed {
    /// Base seed value
    pub seed: u64,
    /// Source of the seed
    pub source: SeedSource,
}

impl SimSeed {
    /// Create a seed
    #[must_use]
    pub fn new(source: SeedSource) -> Self {
        Self {
            seed: source.to_seed(),
            source,
        }
    }

    /// Seed from a literal value
    #[must_use]
    pub fn from_literal(seed: u64) -> Self {
        Self::new(SeedSource::Literal(seed))
    }

    /// Seed from a label such as a stack id
    #[must_use]
    pub fn from_label(label: impl Into<String>) -> Self {
        Self::new(SeedSource::FromString(label.into()))
    }

    /// Independent seed for one consumer, e.g. `"backend"` or `"dns"`
    #[must_use]
    pub fn derive(&self, context: &str) -> Self {
        Self::from_literal(hash_u64(&[&self.seed.to_le_bytes(), context.as_bytes()]))
    }

    /// RNG seeded from this value
    #[must_use]
    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }
}

impl Default for SimSeed {
    fn default() -> Self {
        Self::from_literal(42)
    }
}

fn hash_u64(parts: &[&[u8]]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    let mut head = [0u8; 8];
    head.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(head)
}
