//! Penalty tracking: repeated violations become escalating lockouts.
//!
//! The state machine per key is Clean (no stored state) -> Penalized(1) on
//! the first violation -> Penalized(min(2m, cap)) on violations during an
//! active lockout or within the escalation window -> back to Clean once a
//! full quiet period passes with no violations (store TTL expiry). It is
//! independent of which scope triggered the violations; the multiplier cap
//! and base lockout come from the policy, not from constants here.

use tracing::{debug, warn};

use crate::error::Result;
use crate::policy::PenaltyConfig;
use crate::store::{CounterStore, RateLimitKey};

/// The penalty tracker's ruling for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyVerdict {
    /// The effective decision after lockout state is applied.
    pub allowed: bool,
    /// Seconds until the lockout ends; zero when allowed or when the denial
    /// came from the window alone.
    pub retry_after_secs: u64,
    /// Multiplier now in effect for the key, 0 when clean.
    pub multiplier: u32,
    /// Whether this evaluation raised the multiplier.
    pub escalated: bool,
}

impl PenaltyVerdict {
    fn clean() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
            multiplier: 0,
            escalated: false,
        }
    }
}

/// Apply penalty state to a window decision and record any new violation.
///
/// An active lockout denies regardless of the window decision; the window
/// event was still recorded upstream for auditability. A window denial with
/// no active lockout creates or escalates penalty state atomically in the
/// store and denies this request.
pub async fn evaluate(
    store: &dyn CounterStore,
    key: &RateLimitKey,
    window_allowed: bool,
    penalty: &PenaltyConfig,
    now_ms: u64,
) -> Result<PenaltyVerdict> {
    let prior = store.get_penalty(key, now_ms).await?;

    if let Some(state) = prior.as_ref().filter(|s| s.locked_out_at(now_ms)) {
        if !window_allowed {
            // A further violation while locked out: double down.
            let escalated = store.escalate_penalty(key, penalty, now_ms).await?;
            warn!(
                key = %key,
                multiplier = escalated.penalty_multiplier,
                violations = escalated.violation_count,
                "Violation during active lockout, penalty escalated"
            );
            return Ok(PenaltyVerdict {
                allowed: false,
                retry_after_secs: escalated.retry_after_secs(now_ms),
                multiplier: escalated.penalty_multiplier,
                escalated: escalated.penalty_multiplier > state.penalty_multiplier,
            });
        }

        debug!(key = %key, "Request denied by active lockout");
        return Ok(PenaltyVerdict {
            allowed: false,
            retry_after_secs: state.retry_after_secs(now_ms),
            multiplier: state.penalty_multiplier,
            escalated: false,
        });
    }

    if window_allowed {
        return Ok(match prior {
            // Dormant penalty state (lockout over, quiet period still
            // running) does not block traffic.
            Some(state) => PenaltyVerdict {
                multiplier: state.penalty_multiplier,
                ..PenaltyVerdict::clean()
            },
            None => PenaltyVerdict::clean(),
        });
    }

    // Window violation with no active lockout: transition to Penalized(1)
    // or escalate within the accumulation period, and deny this request.
    let prior_multiplier = prior.map(|s| s.penalty_multiplier).unwrap_or(0);
    let state = store.escalate_penalty(key, penalty, now_ms).await?;
    debug!(
        key = %key,
        multiplier = state.penalty_multiplier,
        violations = state.violation_count,
        "Window violation recorded as penalty"
    );

    Ok(PenaltyVerdict {
        allowed: false,
        retry_after_secs: state.retry_after_secs(now_ms),
        multiplier: state.penalty_multiplier,
        escalated: state.penalty_multiplier > prior_multiplier,
    })
}
