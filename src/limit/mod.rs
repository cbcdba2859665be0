//! The throttling decision engine: window counting, penalty tracking,
//! fail-safety, and the gate that orchestrates them per request.

mod failsafe;
mod gate;
pub mod penalty;
pub mod window;

pub use failsafe::FailSafetyController;
pub use gate::{Decision, RateLimitGate};

use crate::policy::Policy;
use self::penalty::PenaltyVerdict;
use self::window::WindowDecision;

/// Contribution of a single scope to a request's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeOutcome {
    /// Whether this scope admits the request.
    pub allowed: bool,
    /// Seconds until this scope would admit again; zero when allowed.
    pub retry_after_secs: u64,
    /// Quota left in this scope's window.
    pub remaining: u64,
    /// When this scope's window fully resets, epoch seconds.
    pub reset_at_secs: u64,
    /// Penalty multiplier in effect for this scope's key, 0 when clean.
    pub multiplier: u32,
    /// Whether this evaluation escalated the penalty multiplier.
    pub escalated: bool,
    /// Whether this outcome was produced under fail-safety degradation.
    pub degraded: bool,
}

impl ScopeOutcome {
    /// Combine a window decision with the penalty tracker's verdict.
    pub(crate) fn from_checks(
        window: &WindowDecision,
        verdict: &PenaltyVerdict,
        policy: &Policy,
        now_ms: u64,
        degraded: bool,
    ) -> Self {
        let retry_after_secs = if verdict.allowed {
            0
        } else {
            // Whichever constraint releases later governs the retry hint.
            let window_retry = if window.allowed {
                0
            } else {
                window.retry_after_secs(policy.window_seconds, now_ms)
            };
            window_retry.max(verdict.retry_after_secs)
        };

        Self {
            allowed: verdict.allowed,
            retry_after_secs,
            remaining: policy.threshold.saturating_sub(window.count_after),
            reset_at_secs: window.reset_at_secs(policy.window_seconds),
            multiplier: verdict.multiplier,
            escalated: verdict.escalated,
            degraded,
        }
    }

    /// A deny produced because storage is degraded and the policy fails
    /// closed. The retry hint is the policy window: a full picture of the
    /// caller's quota is exactly what is unavailable.
    pub(crate) fn degraded_deny(policy: &Policy, now_ms: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: policy.window_seconds,
            remaining: 0,
            reset_at_secs: now_ms.div_ceil(1000) + policy.window_seconds,
            multiplier: 0,
            escalated: false,
            degraded: true,
        }
    }
}
