//! Settings file and command-line overrides.

use clap::Args;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use meridian_sim::{FailureModel, HarnessConfig, SimSeed};
use std::path::Path;
use std::time::Duration;

/// Flags that override the settings file
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Maximum backend calls in flight within a stage
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Timeout for a single backend call, in milliseconds
    #[arg(long)]
    pub node_timeout_ms: Option<u64>,
    /// Bind service records before any task endpoint exists
    #[arg(long)]
    pub allow_zero_endpoints: bool,
    /// Leave created resources in place when an apply fails
    #[arg(long)]
    pub no_rollback: bool,
    /// Reject public exposure instead of warning
    #[arg(long)]
    pub deny_public_exposure: bool,
    /// Probability of an injected transient backend failure per call
    #[arg(long)]
    pub failure_rate: Option<f64>,
    /// Seed for injected failures
    #[arg(long)]
    pub seed: Option<u64>,
}

impl Overrides {
    /// Apply the flags on top of `config`
    #[must_use]
    pub fn apply(&self, mut config: HarnessConfig) -> HarnessConfig {
        if let Some(concurrency) = self.concurrency {
            config.engine = config.engine.with_concurrency(concurrency);
        }
        if let Some(ms) = self.node_timeout_ms {
            config.engine = config.engine.with_node_timeout(Duration::from_millis(ms));
        }
        if self.allow_zero_endpoints {
            config.binder = config.binder.with_allow_zero_endpoints(true);
        }
        if self.no_rollback {
            config.engine = config.engine.with_rollback_on_failure(false);
        }
        if self.deny_public_exposure {
            config.deny_public_exposure = true;
        }
        if let Some(rate) = self.failure_rate {
            config.failures = FailureModel::new(rate.clamp(0.0, 1.0));
        }
        if let Some(seed) = self.seed {
            config.seed = SimSeed::from_literal(seed);
        }
        config
    }
}

/// Load settings, falling back to defaults without a file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid settings JSON
pub fn load(path: Option<&Path>) -> Result<HarnessConfig> {
    let Some(path) = path else {
        return Ok(HarnessConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read settings {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("Failed to parse settings {}", path.display()))?;
    tracing::debug!(path = %path.display(), "settings loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        assert_eq!(load(None).unwrap(), HarnessConfig::default());
    }

    #[test]
    fn test_file_merges_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "engine": {{ "concurrency": 2 }}, "binder": {{ "bind_timeout_ms": 500 }} }}"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.engine.concurrency, 2);
        assert_eq!(config.engine.node_timeout_ms, 30_000);
        assert_eq!(config.binder.bind_timeout_ms, 500);
        assert!(!config.binder.allow_zero_endpoints);
    }

    #[test]
    fn test_flags_override_file() {
        let overrides = Overrides {
            concurrency: Some(8),
            allow_zero_endpoints: true,
            no_rollback: true,
            failure_rate: Some(2.0),
            seed: Some(11),
            ..Overrides::default()
        };
        let config = overrides.apply(HarnessConfig::default());
        assert_eq!(config.engine.concurrency, 8);
        assert!(config.binder.allow_zero_endpoints);
        assert!(!config.engine.rollback_on_failure);
        assert_eq!(config.failures.probability, 1.0);
        assert_eq!(config.seed, SimSeed::from_literal(11));
    }

    #[test]
    fn test_malformed_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(load(Some(file.path())).is_err());
    }
}
