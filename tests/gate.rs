//! End-to-end tests for the rate limit gate: spec scenarios, concurrency,
//! and degraded-store behavior, all driven with explicit timestamps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use warden::config::StoreConfig;
use warden::error::{Result, WardenError};
use warden::events::{EventKind, MemorySink};
use warden::limit::RateLimitGate;
use warden::policy::{
    FailMode, PenaltyConfig, Policy, PolicyResolver, PolicySet, RequestIdentity, Scope,
    StaticResolver, Tier,
};
use warden::store::{
    CounterStore, FailoverStore, LocalStore, PenaltyState, RateLimitKey, WindowSnapshot,
};

/// A shared-store stub whose availability the test controls. Healthy
/// operations hit a real local store so counts behave normally.
struct ToggleStore {
    healthy: AtomicBool,
    inner: LocalStore,
}

impl ToggleStore {
    fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            inner: LocalStore::new(),
        })
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WardenError::StoreUnavailable("stub down".to_string()))
        }
    }
}

#[async_trait]
impl CounterStore for ToggleStore {
    async fn record_window(&self, key: &RateLimitKey, now_ms: u64) -> Result<WindowSnapshot> {
        self.check()?;
        self.inner.record_window(key, now_ms).await
    }

    async fn get_penalty(&self, key: &RateLimitKey, now_ms: u64) -> Result<Option<PenaltyState>> {
        self.check()?;
        self.inner.get_penalty(key, now_ms).await
    }

    async fn set_penalty(
        &self,
        key: &RateLimitKey,
        state: &PenaltyState,
        ttl_secs: u64,
    ) -> Result<()> {
        self.check()?;
        self.inner.set_penalty(key, state, ttl_secs).await
    }

    async fn escalate_penalty(
        &self,
        key: &RateLimitKey,
        penalty: &PenaltyConfig,
        now_ms: u64,
    ) -> Result<PenaltyState> {
        self.check()?;
        self.inner.escalate_penalty(key, penalty, now_ms).await
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    fn name(&self) -> &'static str {
        "toggle"
    }
}

fn gate_over(shared: Arc<dyn CounterStore>) -> (RateLimitGate, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(FailoverStore::new(shared, sink.clone(), &StoreConfig::default()));
    (RateLimitGate::new(store, sink.clone()), sink)
}

fn healthy_gate() -> (RateLimitGate, Arc<MemorySink>) {
    gate_over(Arc::new(LocalStore::new()))
}

fn ip_policy(threshold: u64, window_seconds: u64) -> Policy {
    Policy {
        name: "ip".to_string(),
        threshold,
        window_seconds,
        scopes: vec![Scope::Ip],
        fail_mode: FailMode::Open,
        tier: Tier::Standard,
        penalty: PenaltyConfig::default(),
    }
}

fn login_policy() -> Policy {
    Policy {
        name: "login".to_string(),
        threshold: 3,
        window_seconds: 900,
        scopes: vec![Scope::Account],
        fail_mode: FailMode::Closed,
        tier: Tier::Anonymous,
        penalty: PenaltyConfig {
            base_lockout_secs: 60,
            multiplier_cap: 8,
            escalation_window_secs: 900,
            quiet_period_secs: 3600,
        },
    }
}

#[tokio::test]
async fn five_per_minute_scenario() {
    let (gate, _) = healthy_gate();
    let identity = RequestIdentity::from_ip("1.2.3.4");
    let policy = ip_policy(5, 60);

    // 5 requests within 10 seconds: all allowed.
    let start = 1_700_000_000_000u64;
    for i in 0..5u64 {
        let decision = gate
            .check(&identity, &policy, start + i * 2_000)
            .await
            .unwrap();
        assert!(decision.allowed, "request {} should pass", i);
    }

    // 6th inside the same 60s window: denied, retry in roughly 50-60s.
    let decision = gate.check(&identity, &policy, start + 10_000).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.violated_scope, Some(Scope::Ip));
    let retry = decision.retry_after_seconds.unwrap();
    assert!((50..=60).contains(&retry), "retry_after was {}", retry);
}

#[tokio::test]
async fn window_rollover_allows_fresh_burst() {
    let (gate, _) = healthy_gate();
    let identity = RequestIdentity::from_ip("1.2.3.4");
    let policy = Policy {
        // No lockouts in this test; the rollover property is about the
        // window alone.
        penalty: PenaltyConfig {
            base_lockout_secs: 0,
            ..PenaltyConfig::default()
        },
        ..ip_policy(5, 60)
    };

    let start = 1_700_000_000_000u64;
    for i in 0..6u64 {
        gate.check(&identity, &policy, start + i).await.unwrap();
    }

    // Wait out the window (and the zero-length lockout): a fresh burst of
    // 5 passes again.
    let later = start + 61_000;
    for i in 0..5u64 {
        let decision = gate.check(&identity, &policy, later + i).await.unwrap();
        assert!(decision.allowed, "post-rollover request {} should pass", i);
    }
}

#[tokio::test]
async fn login_lockout_scenario() {
    let (gate, sink) = healthy_gate();
    let identity = RequestIdentity::default().with_account("victim@example.com");
    let policy = login_policy();

    let start = 1_700_000_000_000u64;

    // 3 failed attempts within 15 minutes: allowed through the gate.
    for i in 0..3u64 {
        let decision = gate
            .check(&identity, &policy, start + i * 60_000)
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    let key = RateLimitKey::new(Scope::Account, "victim@example.com", 900);

    // 4th attempt: window violation, Penalized(1), 1-minute lockout.
    let fourth_at = start + 3 * 60_000;
    let decision = gate.check(&identity, &policy, fourth_at).await.unwrap();
    assert!(!decision.allowed);
    let state = gate
        .store()
        .get_penalty(&key, fourth_at)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.penalty_multiplier, 1);
    assert_eq!(state.lockout_until, Some(fourth_at + 60_000));

    // 5th attempt during the lockout: Penalized(2), 2-minute lockout.
    let fifth_at = fourth_at + 30_000;
    let decision = gate.check(&identity, &policy, fifth_at).await.unwrap();
    assert!(!decision.allowed);
    // The retry hint covers both the lockout and the still-saturated window.
    assert!(decision.retry_after_seconds.unwrap() >= 120);
    let state = gate
        .store()
        .get_penalty(&key, fifth_at)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.penalty_multiplier, 2);
    assert_eq!(state.lockout_until, Some(fifth_at + 120_000));

    // The account identifier never appears in events un-hashed.
    for event in sink.events() {
        assert!(!event.identifier.contains("victim@example.com"));
    }
    assert!(sink.count_of(EventKind::Escalation) >= 2);
}

#[tokio::test]
async fn concurrent_increments_never_lose_updates() {
    // The correctness-critical invariant: concurrent records for one key
    // observe a linear ordering, so their counts are a permutation of
    // 1..=N and exactly `threshold` of them land at or under it.
    let store = Arc::new(LocalStore::new());
    let key = Arc::new(RateLimitKey::new(Scope::Ip, "1.2.3.4", 60));
    let now = 1_700_000_000_000u64;

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.record_window(&key, now).await.unwrap().count })
        })
        .collect();

    let mut counts: Vec<u64> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    counts.sort_unstable();

    assert_eq!(counts, (1..=100).collect::<Vec<u64>>());
    assert_eq!(counts.iter().filter(|&&c| c <= 60).count(), 60);
}

#[tokio::test]
async fn concurrent_gate_checks_never_over_admit() {
    let (gate, _) = healthy_gate();
    let gate = Arc::new(gate);
    let policy = Arc::new(ip_policy(60, 60));
    let now = 1_700_000_000_000u64;

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let gate = gate.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                let identity = RequestIdentity::from_ip("1.2.3.4");
                gate.check(&identity, &policy, now).await.unwrap().allowed
            })
        })
        .collect();

    let admitted = join_all(tasks)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    // A concurrent deny may install a lockout that rejects an in-flight
    // request the window alone would have admitted, so fewer than the
    // threshold can pass; more than the threshold never can.
    assert!(admitted <= 60, "admitted {} of 100 with threshold 60", admitted);
    assert!(admitted > 0);
}

#[tokio::test]
async fn fail_closed_denies_all_traffic() {
    let shared = ToggleStore::new(false);
    let (gate, _) = gate_over(shared);
    let identity = RequestIdentity::default().with_account("acct-1");
    let policy = login_policy();

    let start = 1_700_000_000_000u64;
    for i in 0..20u64 {
        let decision = gate.check(&identity, &policy, start + i).await.unwrap();
        assert!(!decision.allowed, "request {} must be denied fail-closed", i);
        assert!(decision.degraded);
        assert!(decision.retry_after_seconds.is_some());
    }
}

#[tokio::test]
async fn fail_open_enforces_degraded_local_limit() {
    let shared = ToggleStore::new(false);
    let (gate, _) = gate_over(shared);
    let identity = RequestIdentity::from_ip("1.2.3.4");
    let policy = ip_policy(3, 60);

    let start = 1_700_000_000_000u64;
    let mut admitted = 0;
    for i in 0..10u64 {
        let decision = gate.check(&identity, &policy, start + i).await.unwrap();
        assert!(decision.degraded);
        if decision.allowed {
            admitted += 1;
        }
    }

    // Local accounting still bounds the burst; degraded mode is not an
    // unconditional allow.
    assert_eq!(admitted, 3);
}

#[tokio::test]
async fn degraded_transition_emits_single_event_and_fallback_serves() {
    let shared = ToggleStore::new(true);
    let (gate, sink) = gate_over(shared.clone());
    let start = 1_700_000_000_000u64;

    // Healthy warm-up traffic on a global-scope policy.
    let global_policy = Policy {
        name: "global".to_string(),
        threshold: 1000,
        window_seconds: 60,
        scopes: vec![Scope::Global],
        fail_mode: FailMode::Open,
        tier: Tier::Standard,
        penalty: PenaltyConfig::default(),
    };
    let anon = RequestIdentity::default();
    gate.check(&anon, &global_policy, start).await.unwrap();
    assert_eq!(sink.count_of(EventKind::DegradedMode), 0);

    // Store goes down; global traffic trips the breaker.
    shared.set_healthy(false);
    for i in 0..5u64 {
        gate.check(&anon, &global_policy, start + 1_000 + i).await.unwrap();
    }
    assert!(gate.store().is_degraded());

    // IP and account checks keep functioning from the local fallback.
    let identity = RequestIdentity::from_ip("1.2.3.4").with_account("acct-1");
    let policy = Policy {
        scopes: vec![Scope::Ip, Scope::Account],
        ..ip_policy(5, 60)
    };
    for i in 0..5u64 {
        let decision = gate.check(&identity, &policy, start + 2_000 + i).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.degraded);
    }
    let decision = gate.check(&identity, &policy, start + 2_010).await.unwrap();
    assert!(!decision.allowed);

    // One transition, one event - regardless of how many requests ran
    // degraded.
    assert_eq!(sink.count_of(EventKind::DegradedMode), 1);

    // Recovery emits the counterpart transition event once.
    shared.set_healthy(true);
    gate.store().probe_once().await;
    assert!(!gate.store().is_degraded());
    assert_eq!(sink.count_of(EventKind::DegradedMode), 2);
}

#[tokio::test]
async fn escalation_is_monotonic_up_to_cap() {
    let (gate, _) = healthy_gate();
    let identity = RequestIdentity::from_ip("6.6.6.6");
    let policy = ip_policy(1, 60);

    let start = 1_700_000_000_000u64;
    gate.check(&identity, &policy, start).await.unwrap();

    let mut last_retry = 0u64;
    let mut now = start;
    for _ in 0..6 {
        now += 1_000;
        let decision = gate.check(&identity, &policy, now).await.unwrap();
        assert!(!decision.allowed);
        let retry = decision.retry_after_seconds.unwrap();
        assert!(retry >= last_retry.saturating_sub(1), "retry must not shrink");
        last_retry = retry;
    }

    // Capped at 8x the 60s base lockout.
    assert!(last_retry <= 8 * 60);
    assert!(last_retry > 4 * 60);
}

#[tokio::test]
async fn resolver_and_gate_end_to_end() {
    let yaml = r#"
rules:
  - route_prefix: /auth/login
    method: POST
    policy:
      name: login
      threshold: 3
      window_seconds: 900
      scopes: [ip, credential]
      fail_mode: closed
      penalty:
        base_lockout_secs: 60
"#;
    let resolver = StaticResolver::new(PolicySet::from_yaml(yaml).unwrap());
    let (gate, _) = healthy_gate();

    let identity = RequestIdentity::from_ip("1.2.3.4").with_credential("user@example.com");
    let policy = resolver
        .resolve_policy("/auth/login", "POST", &identity)
        .unwrap();
    assert_eq!(policy.tier, Tier::Anonymous);

    let start = 1_700_000_000_000u64;
    for i in 0..3u64 {
        let decision = gate.check(&identity, &policy, start + i * 1_000).await.unwrap();
        assert!(decision.allowed);
    }
    let decision = gate.check(&identity, &policy, start + 10_000).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.violated_scope, Some(Scope::Ip));
}
