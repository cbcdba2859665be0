//! Automatic failover between the shared store and the local fallback.
//!
//! A circuit breaker counts consecutive shared-store failures (errors or
//! per-operation timeouts). Once it trips, all traffic flows to the
//! process-local store until a background probe sees the shared backend
//! answer again. Both flips are security-relevant: each emits a
//! `degraded_mode` event exactly once and is logged at `warn`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Result, WardenError};
use crate::events::{EventSink, SecurityEvent};
use crate::policy::PenaltyConfig;

use super::{now_millis, CounterStore, LocalStore, PenaltyState, RateLimitKey, WindowSnapshot};

/// Store adapter that hides whether the shared backend or the local
/// fallback is active.
pub struct FailoverStore {
    shared: Arc<dyn CounterStore>,
    local: Arc<LocalStore>,
    events: Arc<dyn EventSink>,
    op_timeout: Duration,
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

impl FailoverStore {
    /// Wrap a shared backend with a fresh local fallback.
    pub fn new(
        shared: Arc<dyn CounterStore>,
        events: Arc<dyn EventSink>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            shared,
            local: Arc::new(LocalStore::new()),
            events,
            op_timeout: Duration::from_millis(config.op_timeout_ms),
            failure_threshold: config.failure_threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether the breaker is open and traffic is served locally.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// The per-instance fallback store. The fail-safety controller records
    /// against it directly for fail-closed scopes during degradation.
    pub fn fallback(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Spawn the periodic health probe. Runs until the handle is aborted or
    /// the runtime shuts down; jitter keeps a fleet of instances from
    /// probing in lockstep. The probe also reclaims expired local fallback
    /// entries, which have no server-side TTL.
    pub fn start_health_probe(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let jitter = Duration::from_millis(rand::random::<u64>() % 250);
                tokio::time::sleep(interval + jitter).await;
                store.probe_once().await;
            }
        })
    }

    /// One probe iteration: reclaim expired local entries, then, when
    /// degraded, ping the shared backend and close the breaker on success.
    pub async fn probe_once(&self) {
        self.local.purge_expired(now_millis());

        if !self.is_degraded() {
            return;
        }
        match tokio::time::timeout(self.op_timeout, self.shared.ping()).await {
            Ok(Ok(())) => self.recover(now_millis()),
            Ok(Err(e)) => debug!(error = %e, "Shared store probe failed"),
            Err(_) => debug!("Shared store probe timed out"),
        }
    }

    fn note_failure(&self, op: &'static str, reason: &str, now_ms: u64) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(op, failures, reason, "Shared store operation failed");

        if failures >= self.failure_threshold && !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                failures,
                "Shared store unreachable, flipping to local fallback"
            );
            self.events.emit(&SecurityEvent::degraded_mode(
                true,
                format!("shared store down after {} consecutive failures", failures),
                now_ms,
            ));
        }
    }

    fn recover(&self, now_ms: u64) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            info!("Shared store recovered, leaving local fallback mode");
            self.events.emit(&SecurityEvent::degraded_mode(
                false,
                "shared store answering again",
                now_ms,
            ));
        }
    }

    /// Run a shared-store operation under the op timeout, tracking breaker
    /// state. Transport failures and timeouts surface as `StoreUnavailable`
    /// for the fail-safety controller, never as an ambiguous allow.
    async fn guard<T>(
        &self,
        op: &'static str,
        now_ms: u64,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                Ok(value)
            }
            Ok(Err(err)) if err.is_store_unavailable() => {
                self.note_failure(op, &err.to_string(), now_ms);
                Err(err)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                self.note_failure(op, "timeout", now_ms);
                Err(WardenError::StoreUnavailable(format!(
                    "{} timed out after {:?}",
                    op, self.op_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl CounterStore for FailoverStore {
    async fn record_window(&self, key: &RateLimitKey, now_ms: u64) -> Result<WindowSnapshot> {
        if self.is_degraded() {
            return self.local.record_window(key, now_ms).await;
        }
        self.guard(
            "record_window",
            now_ms,
            self.shared.record_window(key, now_ms),
        )
        .await
    }

    async fn get_penalty(&self, key: &RateLimitKey, now_ms: u64) -> Result<Option<PenaltyState>> {
        if self.is_degraded() {
            return self.local.get_penalty(key, now_ms).await;
        }
        self.guard("get_penalty", now_ms, self.shared.get_penalty(key, now_ms))
            .await
    }

    async fn set_penalty(
        &self,
        key: &RateLimitKey,
        state: &PenaltyState,
        ttl_secs: u64,
    ) -> Result<()> {
        if self.is_degraded() {
            return self.local.set_penalty(key, state, ttl_secs).await;
        }
        self.guard(
            "set_penalty",
            state.last_violation_at,
            self.shared.set_penalty(key, state, ttl_secs),
        )
        .await
    }

    async fn escalate_penalty(
        &self,
        key: &RateLimitKey,
        penalty: &PenaltyConfig,
        now_ms: u64,
    ) -> Result<PenaltyState> {
        if self.is_degraded() {
            return self.local.escalate_penalty(key, penalty, now_ms).await;
        }
        self.guard(
            "escalate_penalty",
            now_ms,
            self.shared.escalate_penalty(key, penalty, now_ms),
        )
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.guard("ping", now_millis(), self.shared.ping()).await
    }

    fn name(&self) -> &'static str {
        "failover"
    }
}
