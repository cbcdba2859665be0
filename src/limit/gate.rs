//! The rate limit gate: per-request orchestration of all scope checks.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{EventSink, SecurityEvent};
use crate::policy::{Policy, RequestIdentity, Scope};
use crate::store::{now_millis, CounterStore, FailoverStore, RateLimitKey};

use super::{penalty, window, FailSafetyController, ScopeOutcome};

/// The gate's ruling for one request. Transient, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Seconds the caller should wait before retrying; `None` when allowed.
    pub retry_after_seconds: Option<u64>,
    /// Remaining quota in the most constrained scope. Advisory.
    pub remaining: u64,
    /// When the most constrained window fully resets, epoch seconds.
    pub reset_at: u64,
    /// The broadest scope that denied, when denied.
    pub violated_scope: Option<Scope>,
    /// Whether any part of this decision was made under storage
    /// degradation.
    pub degraded: bool,
}

/// Orchestrates window counting, penalty tracking, and fail-safety across
/// every scope a policy names, and aggregates one [`Decision`].
///
/// The store handle is passed in explicitly; there is no ambient global
/// state to configure.
pub struct RateLimitGate {
    store: Arc<FailoverStore>,
    failsafe: FailSafetyController,
    events: Arc<dyn EventSink>,
}

impl RateLimitGate {
    /// Create a gate over a failover store, sending security events to
    /// `events`.
    pub fn new(store: Arc<FailoverStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            failsafe: FailSafetyController::new(store.clone()),
            store,
            events,
        }
    }

    /// The underlying store adapter, e.g. to start its health probe.
    pub fn store(&self) -> &Arc<FailoverStore> {
        &self.store
    }

    /// Check a request against a resolved policy at the current wall clock.
    pub async fn check_now(
        &self,
        identity: &RequestIdentity,
        policy: &Policy,
    ) -> Result<Decision> {
        self.check(identity, policy, now_millis()).await
    }

    /// Check a request against a resolved policy.
    ///
    /// Scopes are evaluated broad to specific, and every named scope is
    /// recorded even after one has already denied, so forensic accounting
    /// stays accurate. Recorded quota is never rolled back if the caller
    /// abandons the request. Only `InvalidPolicy` (and internal bugs)
    /// surface as errors; storage failures become part of the decision via
    /// fail-safety.
    pub async fn check(
        &self,
        identity: &RequestIdentity,
        policy: &Policy,
        now_ms: u64,
    ) -> Result<Decision> {
        policy.validate()?;

        let mut outcomes: Vec<(Scope, ScopeOutcome)> = Vec::with_capacity(policy.scopes.len());

        for scope in Scope::EVALUATION_ORDER {
            if !policy.scopes.contains(&scope) {
                continue;
            }

            let Some(identifier) = identity.identifier_for(scope) else {
                // Requested scope without an identifier degrades to a no-op
                // for that scope; the request itself is unaffected.
                warn!(
                    scope = %scope,
                    policy = %policy.name,
                    "Scope requested but no identifier available, skipping"
                );
                continue;
            };

            let key = RateLimitKey::new(scope, identifier, policy.window_seconds);
            let outcome = self.check_scope(&key, policy, now_ms).await?;

            if !outcome.allowed {
                self.events.emit(
                    &SecurityEvent::violation(scope, identifier, outcome.multiplier, now_ms)
                        .with_detail(policy.name.clone()),
                );
            }
            if outcome.escalated {
                self.events.emit(
                    &SecurityEvent::escalation(scope, identifier, outcome.multiplier, now_ms)
                        .with_detail(policy.name.clone()),
                );
            }

            outcomes.push((scope, outcome));
        }

        if outcomes.is_empty() {
            warn!(
                policy = %policy.name,
                "No checkable scope for request, allowing unlimited"
            );
            return Ok(Decision {
                allowed: true,
                retry_after_seconds: None,
                remaining: policy.threshold,
                reset_at: now_ms.div_ceil(1000),
                violated_scope: None,
                degraded: false,
            });
        }

        Ok(Self::aggregate(&outcomes))
    }

    /// Evaluate one scope: window, then penalty, with fail-safety wrapped
    /// around the store path.
    async fn check_scope(
        &self,
        key: &RateLimitKey,
        policy: &Policy,
        now_ms: u64,
    ) -> Result<ScopeOutcome> {
        if let Some(outcome) = self.failsafe.guard_degraded(key, policy, now_ms).await {
            return Ok(outcome);
        }

        let store: &dyn CounterStore = self.store.as_ref();
        let result: Result<ScopeOutcome> = async {
            let decision = window::record_and_check(store, key, policy.threshold, now_ms).await?;
            let verdict =
                penalty::evaluate(store, key, decision.allowed, &policy.penalty, now_ms).await?;
            Ok(ScopeOutcome::from_checks(
                &decision,
                &verdict,
                policy,
                now_ms,
                self.store.is_degraded(),
            ))
        }
        .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_store_unavailable() => {
                self.failsafe.absorb(key, policy, now_ms).await
            }
            Err(err) => Err(err),
        }
    }

    /// Fold per-scope outcomes into one decision. Any deny wins; the retry
    /// hint is the most restrictive among the denying scopes, and the
    /// violated scope is the broadest one.
    fn aggregate(outcomes: &[(Scope, ScopeOutcome)]) -> Decision {
        let mut decision = Decision {
            allowed: true,
            retry_after_seconds: None,
            remaining: u64::MAX,
            reset_at: 0,
            violated_scope: None,
            degraded: false,
        };

        for (scope, outcome) in outcomes {
            decision.remaining = decision.remaining.min(outcome.remaining);
            decision.reset_at = decision.reset_at.max(outcome.reset_at_secs);
            decision.degraded |= outcome.degraded;

            if !outcome.allowed {
                decision.allowed = false;
                if decision.violated_scope.is_none() {
                    decision.violated_scope = Some(*scope);
                }
                let retry = decision.retry_after_seconds.unwrap_or(0);
                decision.retry_after_seconds = Some(retry.max(outcome.retry_after_secs));
            }
        }

        debug!(
            allowed = decision.allowed,
            violated_scope = ?decision.violated_scope,
            remaining = decision.remaining,
            "Gate decision aggregated"
        );
        decision
    }
}
