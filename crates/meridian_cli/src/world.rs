//! Simulated control plane saved between invocations.
//!
//! The simulator keeps its resources and DNS records in memory, so the CLI
//! writes them next to the state database after every command.

use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use meridian_sim::{SimDnsSnapshot, SimHarness, SimWorld};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Saved control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedWorld {
    /// Live resources
    pub world: SimWorld,
    /// DNS records
    pub dns: SimDnsSnapshot,
}

impl SavedWorld {
    /// Capture the harness's control plane
    #[must_use]
    pub fn capture(harness: &SimHarness) -> Self {
        Self {
            world: harness.backend().world(),
            dns: harness.dns().snapshot(),
        }
    }

    /// Load from `path`, or start empty if it does not exist
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).wrap_err_with(|| format!("Failed to parse {}", path.display()))
    }

    /// Write to `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).wrap_err_with(|| format!("Failed to write {}", path.display()))?;
        tracing::debug!(path = %path.display(), resources = self.world.resources.len(), "control plane saved");
        Ok(())
    }
}

/// Where the control plane of a state database is kept
#[must_use]
pub fn path_for(state: &Path) -> PathBuf {
    state.with_extension("sim.json")
}
