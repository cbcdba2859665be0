//! Backing store abstraction for window counters and penalty state.
//!
//! All durable state lives behind the [`CounterStore`] trait: a shared
//! networked backend enforced cluster-wide, a process-local fallback, and a
//! failover wrapper that switches between them. No other component touches
//! storage directly; that mediation is what preserves the per-key atomicity
//! contract.

mod failover;
mod local;
mod shared;

pub use failover::FailoverStore;
pub use local::LocalStore;
pub use shared::SharedStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::policy::{PenaltyConfig, Scope};

/// Current wall-clock time as unix epoch milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Composite identity of one sliding window. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
    /// The limiting dimension.
    pub scope: Scope,
    /// The identifier within that dimension.
    pub identifier: String,
    /// Window length in seconds; part of the key so the same identifier can
    /// be limited under several windows at once.
    pub window_seconds: u64,
}

impl RateLimitKey {
    /// Create a new key.
    pub fn new(scope: Scope, identifier: impl Into<String>, window_seconds: u64) -> Self {
        Self {
            scope,
            identifier: identifier.into(),
            window_seconds,
        }
    }

    /// The window length in milliseconds.
    pub fn window_millis(&self) -> u64 {
        self.window_seconds * 1000
    }

    /// Render the storage key for window state.
    ///
    /// Format: `"rl|{scope}|{identifier}|{window}"`. The `|` delimiter is
    /// uncommon in identifiers; scope and window bound the ambiguity.
    pub fn storage_key(&self) -> String {
        format!(
            "rl|{}|{}|{}",
            self.scope.as_str(),
            self.identifier,
            self.window_seconds
        )
    }

    /// Render the storage key for penalty state.
    ///
    /// Penalty state outlives any single window, so the window length is not
    /// part of this key.
    pub fn penalty_key(&self) -> String {
        format!("pen|{}|{}", self.scope.as_str(), self.identifier)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// Result of atomically recording one event into a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Events in the window after recording, the just-recorded one included.
    pub count: u64,
    /// Timestamp of the oldest event still in the window, epoch millis.
    /// Lets callers compute a precise reset time.
    pub oldest_event_ms: u64,
}

/// Escalating lockout state for one key.
///
/// Created on first violation, mutated on each subsequent one, and expired
/// by the store's TTL after the quiet period. The engine never deletes it
/// explicitly; a clean key is simply absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyState {
    /// Total violations observed while this state has existed.
    pub violation_count: u32,
    /// Current lockout multiplier: 1, 2, 4, ... up to the configured cap.
    pub penalty_multiplier: u32,
    /// End of the active lockout, epoch millis. `None` once expired lockouts
    /// are cleaned, though an in-the-past value is equivalent.
    pub lockout_until: Option<u64>,
    /// When the last violation happened, epoch millis. Drives escalation
    /// window checks.
    pub last_violation_at: u64,
}

impl PenaltyState {
    /// Whether a lockout is active at `now_ms`.
    pub fn locked_out_at(&self, now_ms: u64) -> bool {
        matches!(self.lockout_until, Some(until) if now_ms < until)
    }

    /// Seconds until the lockout ends, rounded up. Zero when not locked out.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        match self.lockout_until {
            Some(until) if until > now_ms => (until - now_ms).div_ceil(1000),
            _ => 0,
        }
    }
}

/// Atomic, TTL-bearing storage for window counters and penalty state.
///
/// The correctness-critical invariant of the whole engine lives here:
/// concurrent calls for the same key must observe a linear, non-lost-update
/// ordering. Both [`record_window`](CounterStore::record_window) and
/// [`escalate_penalty`](CounterStore::escalate_penalty) are single atomic
/// read-modify-write units, never a read followed by a separate write.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically record an event at `now_ms` into the key's sliding window
    /// and return the resulting count plus the oldest surviving timestamp.
    ///
    /// Events older than the key's window are pruned in the same atomic
    /// step. The event is recorded even when the caller will deny.
    async fn record_window(&self, key: &RateLimitKey, now_ms: u64) -> Result<WindowSnapshot>;

    /// Fetch penalty state for a key, or `None` when the key is clean.
    /// `now_ms` drives lazy expiry in backends without server-side TTL.
    async fn get_penalty(&self, key: &RateLimitKey, now_ms: u64) -> Result<Option<PenaltyState>>;

    /// Overwrite penalty state with a TTL. Primarily for operational
    /// tooling; violations go through `escalate_penalty`.
    async fn set_penalty(
        &self,
        key: &RateLimitKey,
        state: &PenaltyState,
        ttl_secs: u64,
    ) -> Result<()>;

    /// Atomically apply one violation to the key's penalty state and return
    /// the new state. Creates Penalized(1) for a clean key, doubles the
    /// multiplier (capped) when the violation lands during an active lockout
    /// or within the escalation window, and refreshes the quiet-period TTL.
    async fn escalate_penalty(
        &self,
        key: &RateLimitKey,
        penalty: &PenaltyConfig,
        now_ms: u64,
    ) -> Result<PenaltyState>;

    /// Cheap liveness check, used by the failover health probe.
    async fn ping(&self) -> Result<()>;

    /// Short backend name for logs and events.
    fn name(&self) -> &'static str;
}

/// Compute the escalated state for one violation. Shared by both backends
/// so local fallback and shared store agree on semantics; each backend is
/// responsible for running it atomically.
pub(crate) fn apply_violation(
    prior: Option<&PenaltyState>,
    penalty: &PenaltyConfig,
    now_ms: u64,
) -> PenaltyState {
    let (violations, multiplier) = match prior {
        None => (0, 0),
        Some(p) => (p.violation_count, p.penalty_multiplier),
    };

    let new_multiplier = match prior {
        None => 1,
        Some(p) => {
            let escalates = p.locked_out_at(now_ms)
                || now_ms.saturating_sub(p.last_violation_at)
                    <= penalty.escalation_window_secs * 1000;
            if escalates {
                (multiplier * 2).min(penalty.multiplier_cap).max(1)
            } else {
                // Outside the escalation window the multiplier holds; it only
                // decays by quiet-period expiry of the whole state.
                multiplier.max(1)
            }
        }
    };

    PenaltyState {
        violation_count: violations + 1,
        penalty_multiplier: new_multiplier,
        lockout_until: Some(now_ms + penalty.base_lockout_secs * 1000 * new_multiplier as u64),
        last_violation_at: now_ms,
    }
}
