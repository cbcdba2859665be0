//! Sliding window counting.
//!
//! An exact sliding window over event timestamps, not fixed buckets: a
//! burst straddling a bucket boundary cannot sneak through at double rate.
//! The store keeps the timestamps; this module owns the decision rule and
//! the derived reset arithmetic.

use tracing::trace;

use crate::error::{Result, WardenError};
use crate::store::{CounterStore, RateLimitKey};

/// Outcome of recording one event into a key's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    /// Events in the window including the one just recorded.
    pub count_after: u64,
    /// Whether the event fit within the threshold.
    pub allowed: bool,
    /// Oldest event still inside the window, epoch millis.
    pub oldest_event_ms: u64,
}

impl WindowDecision {
    /// When the window fully drains, epoch seconds (rounded up).
    pub fn reset_at_secs(&self, window_seconds: u64) -> u64 {
        (self.oldest_event_ms + window_seconds * 1000).div_ceil(1000)
    }

    /// Seconds until the oldest event ages out and one slot frees up.
    /// At least 1 when denied, since a retry in the same second would fail.
    pub fn retry_after_secs(&self, window_seconds: u64, now_ms: u64) -> u64 {
        let frees_at_ms = self.oldest_event_ms + window_seconds * 1000;
        frees_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1)
    }
}

/// Record an event for `key` at `now_ms` and decide whether it fits within
/// `threshold` events per the key's window.
///
/// The event is recorded unconditionally, deny included, so sustained
/// attack traffic never gets a free pass once its window partially decays.
/// Store failures surface as `StoreUnavailable`; they are never mapped to
/// an allow.
pub async fn record_and_check(
    store: &dyn CounterStore,
    key: &RateLimitKey,
    threshold: u64,
    now_ms: u64,
) -> Result<WindowDecision> {
    if threshold == 0 || key.window_seconds == 0 {
        return Err(WardenError::InvalidPolicy(format!(
            "window check for {} needs positive threshold and window",
            key
        )));
    }
    if key.identifier.is_empty() {
        return Err(WardenError::Misconfiguration(format!(
            "empty identifier for {} scope",
            key.scope
        )));
    }

    let snapshot = store.record_window(key, now_ms).await?;
    let allowed = snapshot.count <= threshold;

    trace!(
        key = %key,
        count = snapshot.count,
        threshold,
        allowed,
        "Window check"
    );

    Ok(WindowDecision {
        count_after: snapshot.count,
        allowed,
        oldest_event_ms: snapshot.oldest_event_ms,
    })
}
