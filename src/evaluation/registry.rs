//! Policy registry
//!
//! Maps a policy name to a constructor. The registry is built once at
//! startup and shared; the runner instantiates policies from their config at
//! the start of each application's evaluation.

use super::policies::*;
use super::EvaluationPolicy;
use crate::config::PolicyConfig;
use crate::error::{EvalError, Result};
use crate::types::MetricKind;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a policy instance from its configuration
pub type PolicyFactory = Arc<dyn Fn(&PolicyConfig) -> Arc<dyn EvaluationPolicy> + Send + Sync>;

/// Short names accepted in configuration next to the metric-kind names
const ALIASES: [(&str, MetricKind); 10] = [
    ("toxicity", MetricKind::SafetyToxicity),
    ("bias_fairness", MetricKind::SafetyBiasFairness),
    ("robustness", MetricKind::SafetyRobustness),
    ("compliance", MetricKind::SafetyCompliance),
    ("groundedness", MetricKind::PerformanceGroundednessFaithfulness),
    ("relevance", MetricKind::PerformanceRelevance),
    ("precision", MetricKind::PerformancePrecisionCoherence),
    ("readability", MetricKind::PerformanceReadabilityFluencyStyle),
    ("latency", MetricKind::SystemReliabilityLatency),
    ("availability", MetricKind::SystemReliabilityAvailabilityResourceHealth),
];

/// Wrap a concrete constructor as a [`PolicyFactory`]
pub fn policy_factory<P, F>(build: F) -> PolicyFactory
where
    P: EvaluationPolicy + 'static,
    F: Fn(&PolicyConfig) -> P + Send + Sync + 'static,
{
    Arc::new(move |config: &PolicyConfig| -> Arc<dyn EvaluationPolicy> { Arc::new(build(config)) })
}

fn builtin_factory(kind: MetricKind) -> PolicyFactory {
    match kind {
        MetricKind::SafetyToxicity => policy_factory(SafetyToxicityPolicy::new),
        MetricKind::SafetyBiasFairness => policy_factory(SafetyBiasFairnessPolicy::new),
        MetricKind::SafetyRobustness => policy_factory(SafetyRobustnessPolicy::new),
        MetricKind::SafetyCompliance => policy_factory(SafetyCompliancePolicy::new),
        MetricKind::PerformanceGroundednessFaithfulness => {
            policy_factory(PerformanceGroundednessFaithfulnessPolicy::new)
        }
        MetricKind::PerformanceRelevance => policy_factory(PerformanceRelevancePolicy::new),
        MetricKind::PerformancePrecisionCoherence => {
            policy_factory(PerformancePrecisionCoherencePolicy::new)
        }
        MetricKind::PerformanceReadabilityFluencyStyle => {
            policy_factory(PerformanceReadabilityFluencyStylePolicy::new)
        }
        MetricKind::SystemReliabilityLatency => policy_factory(SystemReliabilityLatencyPolicy::new),
        MetricKind::SystemReliabilityAvailabilityResourceHealth => {
            policy_factory(SystemReliabilityAvailabilityResourceHealthPolicy::new)
        }
    }
}

/// Name to constructor map
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    factories: BTreeMap<String, PolicyFactory>,
}

impl PolicyRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in policy under its metric-kind name
    /// and its short alias
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for kind in MetricKind::ALL {
            registry.register(kind.as_str(), builtin_factory(kind));
        }
        for (alias, kind) in ALIASES {
            registry.register(alias, builtin_factory(kind));
        }
        registry
    }

    /// Add or replace a policy constructor
    pub fn register(&mut self, name: impl Into<String>, factory: PolicyFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Instantiate the policy registered under `config.name`
    pub fn create(&self, config: &PolicyConfig) -> Result<Arc<dyn EvaluationPolicy>> {
        let factory = self
            .factories
            .get(&config.name)
            .ok_or_else(|| EvalError::UnknownPolicy(config.name.clone()))?;
        Ok(factory(config))
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("policies", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
