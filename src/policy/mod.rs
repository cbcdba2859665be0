//! Rate limit policies and the collaborator interfaces that supply them.
//!
//! The engine is policy-agnostic: it consumes resolved [`Policy`] values and
//! never decides which limiter applies to a route. That decision belongs to
//! the routing layer, reached through the [`PolicyResolver`] and
//! [`TierClassifier`] traits.

mod resolver;

pub use resolver::{FixedTierClassifier, PolicySet, RouteRule, StaticResolver};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// One dimension along which requests are grouped for limiting.
///
/// Declaration order is broad to specific; the gate evaluates scopes in this
/// order so cheap, wide checks run before per-identity work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Service-wide flood control.
    Global,
    /// A class of endpoints (e.g., "auth", "search").
    EndpointClass,
    /// Source IP address.
    Ip,
    /// Authenticated account identifier.
    Account,
    /// Credential identifier presented in the request (e.g., login email),
    /// tracked even before authentication succeeds.
    Credential,
}

impl Scope {
    /// All scopes in gate evaluation order (broad to specific).
    pub const EVALUATION_ORDER: [Scope; 5] = [
        Scope::Global,
        Scope::EndpointClass,
        Scope::Ip,
        Scope::Account,
        Scope::Credential,
    ];

    /// Stable string form used in storage keys and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::EndpointClass => "endpoint_class",
            Scope::Ip => "ip",
            Scope::Account => "account",
            Scope::Credential => "credential",
        }
    }

    /// Whether identifiers for this scope are sensitive and must be hashed
    /// before appearing in security events.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Scope::Account | Scope::Credential)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller tier, fed into policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Unauthenticated traffic.
    Anonymous,
    /// Regular authenticated users.
    Standard,
    /// Paying or elevated-trust users.
    Premium,
    /// First-party service traffic.
    Internal,
}

impl Tier {
    /// The tier applied when classification fails.
    pub fn most_restrictive() -> Self {
        Tier::Anonymous
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::most_restrictive()
    }
}

/// What happens to a scope's contribution when the backing store cannot
/// make a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Allow through degraded local accounting. Acceptable for
    /// low-sensitivity general traffic.
    Open,
    /// Deny the request. The safer default for authentication-class
    /// endpoints.
    Closed,
}

impl Default for FailMode {
    fn default() -> Self {
        FailMode::Closed
    }
}

/// Escalating-lockout parameters, carried by the policy rather than
/// hard-coded in the penalty tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Lockout duration for the first violation, in seconds.
    #[serde(default = "default_base_lockout")]
    pub base_lockout_secs: u64,

    /// Upper bound on the penalty multiplier (1, 2, 4, ... cap).
    #[serde(default = "default_multiplier_cap")]
    pub multiplier_cap: u32,

    /// Violations within this many seconds of the previous one escalate the
    /// multiplier. Independent of the quiet period.
    #[serde(default = "default_escalation_window")]
    pub escalation_window_secs: u64,

    /// Seconds of zero violations after which penalty state expires back to
    /// clean. Also the TTL of stored penalty state.
    #[serde(default = "default_quiet_period")]
    pub quiet_period_secs: u64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            base_lockout_secs: default_base_lockout(),
            multiplier_cap: default_multiplier_cap(),
            escalation_window_secs: default_escalation_window(),
            quiet_period_secs: default_quiet_period(),
        }
    }
}

fn default_base_lockout() -> u64 {
    60
}

fn default_multiplier_cap() -> u32 {
    8
}

fn default_escalation_window() -> u64 {
    900
}

fn default_quiet_period() -> u64 {
    3600
}

/// A resolved rate limit policy. Supplied per-request by the policy
/// resolver; the engine never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Name for logging and events.
    #[serde(default)]
    pub name: String,

    /// Maximum events allowed per window.
    pub threshold: u64,

    /// Sliding window length in seconds.
    pub window_seconds: u64,

    /// Which dimensions to check for this policy.
    pub scopes: Vec<Scope>,

    /// Degraded-mode behavior when the store cannot decide.
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Tier this policy was resolved for.
    #[serde(default)]
    pub tier: Tier,

    /// Escalating lockout parameters.
    #[serde(default)]
    pub penalty: PenaltyConfig,
}

impl Policy {
    /// Validate the policy before any store work happens.
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(WardenError::InvalidPolicy(format!(
                "policy '{}' has zero threshold",
                self.name
            )));
        }
        if self.window_seconds == 0 {
            return Err(WardenError::InvalidPolicy(format!(
                "policy '{}' has zero window",
                self.name
            )));
        }
        if self.scopes.is_empty() {
            return Err(WardenError::InvalidPolicy(format!(
                "policy '{}' has no scopes",
                self.name
            )));
        }
        Ok(())
    }
}

/// The caller identity facets a request carries. Scopes without an
/// identifier degrade to a no-op for that scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Source IP address, rendered as a string.
    pub ip: Option<String>,
    /// Authenticated account identifier.
    pub account: Option<String>,
    /// Credential identifier presented (e.g., login email).
    pub credential: Option<String>,
    /// Endpoint class of the request.
    pub endpoint_class: Option<String>,
}

impl RequestIdentity {
    /// Identity with only a source IP, the common unauthenticated case.
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Default::default()
        }
    }

    /// Set the account identifier.
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Set the credential identifier.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Set the endpoint class.
    pub fn with_endpoint_class(mut self, class: impl Into<String>) -> Self {
        self.endpoint_class = Some(class.into());
        self
    }

    /// The identifier this request carries for a scope, if any. An empty
    /// string counts as absent, so the scope degrades to a no-op instead of
    /// failing the request downstream.
    pub fn identifier_for(&self, scope: Scope) -> Option<&str> {
        let identifier = match scope {
            Scope::Global => return Some("all"),
            Scope::EndpointClass => self.endpoint_class.as_deref(),
            Scope::Ip => self.ip.as_deref(),
            Scope::Account => self.account.as_deref(),
            Scope::Credential => self.credential.as_deref(),
        };
        identifier.filter(|id| !id.is_empty())
    }
}

/// Resolves the applicable policy for a request.
///
/// Implementations must be pure from the engine's perspective: no store
/// access and no visible side effects.
pub trait PolicyResolver: Send + Sync {
    /// Return the policy that applies to `route` + `method` for `identity`.
    fn resolve_policy(
        &self,
        route: &str,
        method: &str,
        identity: &RequestIdentity,
    ) -> Result<Policy>;
}

/// Classifies a caller into a [`Tier`] for policy selection.
///
/// Implementations that cannot classify should return
/// [`Tier::most_restrictive`] rather than fail.
pub trait TierClassifier: Send + Sync {
    /// Classify the caller's tier.
    fn classify_tier(&self, identity: &RequestIdentity) -> Tier;
}
