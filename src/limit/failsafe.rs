//! Fail-safety: what happens when the store cannot make a decision.
//!
//! Each policy declares a `fail_mode`. Closed denies the affected scope,
//! the safer call for authentication-class endpoints. Open re-runs the
//! check against the per-instance fallback store, so degraded mode still
//! enforces a limit rather than waving everything through. Either way the
//! degraded decision is logged distinctly from a normal deny, so operators
//! can tell "blocked legitimately" from "blocked because storage degraded".

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::policy::{FailMode, Policy};
use crate::store::{CounterStore, FailoverStore, RateLimitKey};

use super::{penalty, window, ScopeOutcome};

/// Applies the configured fail-open/fail-closed policy per scope.
pub struct FailSafetyController {
    store: Arc<FailoverStore>,
}

impl FailSafetyController {
    /// Build a controller over the failover store.
    pub fn new(store: Arc<FailoverStore>) -> Self {
        Self { store }
    }

    /// Pre-check for an already-degraded store adapter.
    ///
    /// Fail-closed scopes never accept per-instance accounting: while the
    /// breaker is open they deny outright. The event is still recorded in
    /// the local store so forensic counts stay complete. Fail-open scopes
    /// return `None` here and proceed normally; the failover store routes
    /// them to the local backend transparently.
    pub async fn guard_degraded(
        &self,
        key: &RateLimitKey,
        policy: &Policy,
        now_ms: u64,
    ) -> Option<ScopeOutcome> {
        if !self.store.is_degraded() || policy.fail_mode != FailMode::Closed {
            return None;
        }

        let _ = self.store.fallback().record_window(key, now_ms).await;
        warn!(
            key = %key,
            policy = %policy.name,
            "Denying fail-closed scope while store adapter is degraded"
        );
        Some(ScopeOutcome::degraded_deny(policy, now_ms))
    }

    /// Absorb a `StoreUnavailable` from one scope's check.
    ///
    /// Applies only to that scope's contribution; one scope failing open
    /// never overrides another scope's deny.
    pub async fn absorb(
        &self,
        key: &RateLimitKey,
        policy: &Policy,
        now_ms: u64,
    ) -> Result<ScopeOutcome> {
        match policy.fail_mode {
            FailMode::Closed => {
                let _ = self.store.fallback().record_window(key, now_ms).await;
                warn!(
                    key = %key,
                    policy = %policy.name,
                    "Store unavailable, failing closed"
                );
                Ok(ScopeOutcome::degraded_deny(policy, now_ms))
            }
            FailMode::Open => {
                warn!(
                    key = %key,
                    policy = %policy.name,
                    "Store unavailable, failing open to local accounting"
                );
                let local = self.store.fallback();
                let decision =
                    window::record_and_check(local.as_ref(), key, policy.threshold, now_ms).await?;
                let verdict = penalty::evaluate(
                    local.as_ref(),
                    key,
                    decision.allowed,
                    &policy.penalty,
                    now_ms,
                )
                .await?;
                Ok(ScopeOutcome::from_checks(
                    &decision, &verdict, policy, now_ms, true,
                ))
            }
        }
    }
}
