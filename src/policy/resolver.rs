//! Static policy resolution from configuration.
//!
//! This module ships a YAML-configured [`PolicyResolver`] so the engine can
//! be exercised without standing up a routing layer. Rules match on a route
//! prefix and optional method; the longest matching prefix wins, and a rule
//! may override its threshold per caller tier.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{Result, WardenError};

use super::{Policy, PolicyResolver, RequestIdentity, Tier, TierClassifier};

/// A single route-matching rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Route prefix to match (e.g., `/auth/login`).
    pub route_prefix: String,

    /// Method to match. When absent, the rule matches any method.
    #[serde(default)]
    pub method: Option<String>,

    /// The policy applied when this rule matches.
    pub policy: Policy,

    /// Per-tier threshold overrides. Tiers not listed keep the policy's
    /// base threshold.
    #[serde(default)]
    pub tier_thresholds: HashMap<Tier, u64>,
}

impl RouteRule {
    fn matches(&self, route: &str, method: &str) -> bool {
        if !route.starts_with(&self.route_prefix) {
            return false;
        }
        match &self.method {
            Some(m) => m.eq_ignore_ascii_case(method),
            None => true,
        }
    }
}

/// A complete set of policy rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySet {
    /// All rules, in no particular order; matching picks the longest prefix.
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

impl PolicySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a policy set from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy set");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set: PolicySet = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse policy set: {}", e)))?;

        for rule in &set.rules {
            rule.policy.validate()?;
        }
        Ok(set)
    }

    /// Find the best-matching rule for a route and method.
    ///
    /// Longer prefixes take precedence over shorter ones; among equal
    /// lengths, a method-specific rule beats a wildcard.
    pub fn find_rule(&self, route: &str, method: &str) -> Option<&RouteRule> {
        self.rules
            .iter()
            .filter(|r| r.matches(route, method))
            .max_by_key(|r| (r.route_prefix.len(), r.method.is_some()))
    }
}

/// A [`TierClassifier`] that assigns every caller the same tier.
///
/// The default classifies everything as the most restrictive tier, which is
/// also the mandated behavior when tier lookup fails upstream.
#[derive(Debug, Clone, Copy)]
pub struct FixedTierClassifier(pub Tier);

impl Default for FixedTierClassifier {
    fn default() -> Self {
        Self(Tier::most_restrictive())
    }
}

impl TierClassifier for FixedTierClassifier {
    fn classify_tier(&self, _identity: &RequestIdentity) -> Tier {
        self.0
    }
}

/// Policy resolver backed by a static [`PolicySet`].
pub struct StaticResolver {
    set: PolicySet,
    classifier: Box<dyn TierClassifier>,
}

impl StaticResolver {
    /// Create a resolver with the default (most restrictive) tier
    /// classification.
    pub fn new(set: PolicySet) -> Self {
        Self {
            set,
            classifier: Box::new(FixedTierClassifier::default()),
        }
    }

    /// Create a resolver with a custom tier classifier.
    pub fn with_classifier(set: PolicySet, classifier: Box<dyn TierClassifier>) -> Self {
        Self { set, classifier }
    }
}

impl PolicyResolver for StaticResolver {
    fn resolve_policy(
        &self,
        route: &str,
        method: &str,
        identity: &RequestIdentity,
    ) -> Result<Policy> {
        let rule = self.set.find_rule(route, method).ok_or_else(|| {
            WardenError::Misconfiguration(format!("no policy rule matches {} {}", method, route))
        })?;

        let tier = self.classifier.classify_tier(identity);

        let mut policy = rule.policy.clone();
        policy.tier = tier;
        if policy.name.is_empty() {
            policy.name = rule.route_prefix.clone();
        }
        if let Some(&threshold) = rule.tier_thresholds.get(&tier) {
            policy.threshold = threshold;
        }

        policy.validate()?;
        Ok(policy)
    }
}
