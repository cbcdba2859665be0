//! In-process fallback store.
//!
//! Consistent only within one instance: when the shared backend is down and
//! traffic flows here, limits become per-instance. That weakening is an
//! accepted, documented trade-off surfaced through degraded-mode events,
//! never a silent one.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::Result;
use crate::policy::PenaltyConfig;

use super::{apply_violation, CounterStore, PenaltyState, RateLimitKey, WindowSnapshot};

#[derive(Debug, Default)]
struct WindowSlot {
    /// Event timestamps in arrival order, epoch millis.
    events: VecDeque<u64>,
    /// Window length, kept here so maintenance can prune without the key.
    window_ms: u64,
}

#[derive(Debug, Clone)]
struct PenaltyEntry {
    state: PenaltyState,
    expires_at_ms: u64,
}

/// Process-local counter store backed by concurrent maps.
///
/// Atomicity comes from the per-entry guards: every read-modify-write runs
/// while holding the entry lock for its key, so concurrent callers for the
/// same key observe a linear ordering.
#[derive(Debug, Default)]
pub struct LocalStore {
    windows: DashMap<String, WindowSlot>,
    penalties: DashMap<String, PenaltyEntry>,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live window entries, primarily for tests and introspection.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Drop window entries whose newest event fell out of twice its window,
    /// and penalty entries past their TTL. There is no server-side expiry
    /// here, so hosts should call this periodically.
    pub fn purge_expired(&self, now_ms: u64) {
        self.windows.retain(|_, slot| match slot.events.back() {
            Some(&newest) => now_ms.saturating_sub(newest) < slot.window_ms.saturating_mul(2),
            None => false,
        });
        self.penalties
            .retain(|_, entry| entry.expires_at_ms > now_ms);

        debug!(
            windows = self.windows.len(),
            penalties = self.penalties.len(),
            "Local store purge complete"
        );
    }
}

#[async_trait]
impl CounterStore for LocalStore {
    async fn record_window(&self, key: &RateLimitKey, now_ms: u64) -> Result<WindowSnapshot> {
        let mut slot = self
            .windows
            .entry(key.storage_key())
            .or_insert_with(|| WindowSlot {
                events: VecDeque::new(),
                window_ms: key.window_millis(),
            });

        // Drop everything strictly older than the trailing window. An event
        // aged exactly window_seconds still counts.
        let cutoff = now_ms.saturating_sub(key.window_millis());
        while let Some(&front) = slot.events.front() {
            if front < cutoff {
                slot.events.pop_front();
            } else {
                break;
            }
        }

        slot.events.push_back(now_ms);
        let oldest = slot.events.front().copied().unwrap_or(now_ms);

        Ok(WindowSnapshot {
            count: slot.events.len() as u64,
            oldest_event_ms: oldest,
        })
    }

    async fn get_penalty(&self, key: &RateLimitKey, now_ms: u64) -> Result<Option<PenaltyState>> {
        let penalty_key = key.penalty_key();
        if let Some(entry) = self.penalties.get(&penalty_key) {
            if entry.expires_at_ms > now_ms {
                return Ok(Some(entry.state.clone()));
            }
        }
        // Quiet period elapsed: the key is clean again.
        self.penalties
            .remove_if(&penalty_key, |_, entry| entry.expires_at_ms <= now_ms);
        Ok(None)
    }

    async fn set_penalty(
        &self,
        key: &RateLimitKey,
        state: &PenaltyState,
        ttl_secs: u64,
    ) -> Result<()> {
        self.penalties.insert(
            key.penalty_key(),
            PenaltyEntry {
                state: state.clone(),
                expires_at_ms: state.last_violation_at + ttl_secs * 1000,
            },
        );
        Ok(())
    }

    async fn escalate_penalty(
        &self,
        key: &RateLimitKey,
        penalty: &PenaltyConfig,
        now_ms: u64,
    ) -> Result<PenaltyState> {
        let expires_at_ms = now_ms + penalty.quiet_period_secs * 1000;

        let state = match self.penalties.entry(key.penalty_key()) {
            Entry::Occupied(mut occupied) => {
                let prior = (occupied.get().expires_at_ms > now_ms)
                    .then(|| occupied.get().state.clone());
                let state = apply_violation(prior.as_ref(), penalty, now_ms);
                occupied.insert(PenaltyEntry {
                    state: state.clone(),
                    expires_at_ms,
                });
                state
            }
            Entry::Vacant(vacant) => {
                let state = apply_violation(None, penalty, now_ms);
                vacant.insert(PenaltyEntry {
                    state: state.clone(),
                    expires_at_ms,
                });
                state
            }
        };

        Ok(state)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
