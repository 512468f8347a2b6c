//! Seeded failure injection.
//!
//! A [`FailureModel`] says how often and how the simulated control plane
//! misbehaves; a [`FaultInjector`] draws from it with a ChaCha stream so
//! the same seed and call order give the same failures.

use crate::seed::SimSeed;
use meridian_runtime::BackendError;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Kind of failure to inject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request throttled
    Throttle,
    /// Referenced resource not visible yet
    Propagation,
    /// Control plane briefly down
    Unavailable,
    /// Slow call that still succeeds
    Latency {
        /// Added delay in milliseconds
        ms: u64,
    },
}

impl FailureKind {
    /// What the injector does for this kind at `context`
    #[must_use]
    pub fn injection(&self, context: &str) -> Injection {
        match self {
            Self::Throttle => Injection::Error(BackendError::RateLimited(format!("{} throttled", context))),
            Self::Propagation => {
                Injection::Error(BackendError::Propagating(format!("{} not visible yet", context)))
            }
            Self::Unavailable => {
                Injection::Error(BackendError::Unavailable(format!("{} endpoint unavailable", context)))
            }
            Self::Latency { ms } => Injection::Delay(Duration::from_millis(*ms)),
        }
    }
}

/// Outcome of one draw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    /// Fail the call with this error
    Error(BackendError),
    /// Delay the call, then let it proceed
    Delay(Duration),
}

/// When and how failures occur
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureModel {
    /// Probability of failure at each call
    pub probability: f64,
    /// Maximum number of failures to inject
    pub max_failures: usize,
    /// Kinds of failures to inject
    pub kinds: Vec<FailureKind>,
}

impl FailureModel {
    /// Create a model failing with `probability`
    #[must_use]
    pub fn new(probability: f64) -> Self {
        Self {
            probability,
            max_failures: usize::MAX,
            kinds: vec![FailureKind::Throttle, FailureKind::Propagation, FailureKind::Unavailable],
        }
    }

    /// Set max failures
    #[must_use]
    pub fn with_max_failures(mut self, max: usize) -> Self {
        self.max_failures = max;
        self
    }

    /// Set failure kinds
    #[must_use]
    pub fn with_kinds(mut self, kinds: Vec<FailureKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Check if failure should occur
    #[must_use]
    pub fn should_fail(&self, rng: &mut ChaCha8Rng) -> bool {
        rng.r#gen::<f64>() < self.probability
    }

    /// Pick a failure kind
    #[must_use]
    pub fn random_kind(&self, rng: &mut ChaCha8Rng) -> FailureKind {
        if self.kinds.is_empty() {
            return FailureKind::Throttle;
        }
        self.kinds[rng.gen_range(0..self.kinds.len())].clone()
    }
}

impl Default for FailureModel {
    fn default() -> Self {
        Self::new(0.0)
    }
}

struct Draws {
    rng: ChaCha8Rng,
    injected: usize,
}

/// Draws failures from a model
pub struct FaultInjector {
    model: FailureModel,
    draws: Mutex<Draws>,
}

impl FaultInjector {
    /// Create an injector
    #[must_use]
    pub fn new(seed: &SimSeed, model: FailureModel) -> Self {
        Self {
            model,
            draws: Mutex::new(Draws {
                rng: seed.rng(),
                injected: 0,
            }),
        }
    }

    /// The model drawn from
    #[must_use]
    pub fn model(&self) -> &FailureModel {
        &self.model
    }

    /// Draw for one call at `context`
    pub fn draw(&self, context: &str) -> Option<Injection> {
        let mut draws = self.draws.lock().unwrap_or_else(PoisonError::into_inner);
        if draws.injected >= self.model.max_failures || !self.model.should_fail(&mut draws.rng) {
            return None;
        }
        draws.injected += 1;
        let kind = self.model.random_kind(&mut draws.rng);
        tracing::debug!(context, kind = ?kind, "injecting failure");
        Some(kind.injection(context))
    }

    /// Failures injected so far
    #[must_use]
    pub fn injected(&self) -> usize {
        self.draws.lock().unwrap_or_else(PoisonError::into_inner).injected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_probability_never_fails() {
        let injector = FaultInjector::new(&SimSeed::default(), FailureModel::default());
        assert!((0..100).all(|_| injector.draw("vpc").is_none()));
        assert_eq!(injector.injected(), 0);
    }

    #[test]
    fn test_max_failures_respected() {
        let injector = FaultInjector::new(&SimSeed::default(), FailureModel::new(1.0).with_max_failures(3));
        let injected = (0..10).filter_map(|_| injector.draw("vpc")).count();
        assert_eq!(injected, 3);
        assert_eq!(injector.injected(), 3);
    }

    #[test]
    fn test_injected_errors_are_transient() {
        let injector = FaultInjector::new(&SimSeed::from_literal(3), FailureModel::new(1.0));
        for _ in 0..20 {
            match injector.draw("svc") {
                Some(Injection::Error(err)) => assert!(err.is_transient()),
                other => panic!("unexpected draw {:?}", other),
            }
        }
    }

    #[test]
    fn test_latency_kind() {
        let model = FailureModel::new(1.0).with_kinds(vec![FailureKind::Latency { ms: 5 }]);
        let injector = FaultInjector::new(&SimSeed::default(), model);
        assert_eq!(injector.draw("svc"), Some(Injection::Delay(Duration::from_millis(5))));
    }

    proptest! {
        #[test]
        fn prop_same_seed_same_failures(seed in any::<u64>(), probability in 0.0f64..1.0) {
            let model = FailureModel::new(probability);
            let a = FaultInjector::new(&SimSeed::from_literal(seed), model.clone());
            let b = FaultInjector::new(&SimSeed::from_literal(seed), model);
            for _ in 0..32 {
                prop_assert_eq!(a.draw("n"), b.draw("n"));
            }
        }
    }
}
