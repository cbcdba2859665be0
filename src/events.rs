//! Structured security events emitted by the engine.
//!
//! The engine does not own event storage or alerting; it hands
//! [`SecurityEvent`] values to an [`EventSink`] supplied by the host
//! application. Sensitive identifiers (accounts, credentials) are hashed
//! before they reach the sink.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::policy::Scope;

/// Hex length of the truncated identifier digest carried in events.
const HASH_PREFIX_LEN: usize = 16;

/// Kinds of security-relevant occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A scope denied a request.
    Violation,
    /// A penalty multiplier increased for a key.
    Escalation,
    /// The store adapter entered or left degraded (local fallback) mode.
    DegradedMode,
}

impl EventKind {
    /// Stable string form for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Violation => "violation",
            EventKind::Escalation => "escalation",
            EventKind::DegradedMode => "degraded_mode",
        }
    }
}

/// A single security event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// What happened.
    pub kind: EventKind,
    /// The scope involved, when the event concerns one key.
    pub scope: Option<Scope>,
    /// Redacted identifier: hashed for sensitive scopes, verbatim otherwise.
    /// Serialized as `identifier_hash`, the name consumers index on.
    #[serde(rename = "identifier_hash")]
    pub identifier: String,
    /// Penalty multiplier in effect, 0 when not applicable.
    pub multiplier: u32,
    /// Event time, unix epoch milliseconds.
    pub timestamp_ms: u64,
    /// Free-form context (policy name, transition direction).
    pub detail: String,
}

impl SecurityEvent {
    /// Build a violation event for a denied scope.
    pub fn violation(scope: Scope, identifier: &str, multiplier: u32, now_ms: u64) -> Self {
        Self {
            kind: EventKind::Violation,
            scope: Some(scope),
            identifier: redact_identifier(scope, identifier),
            multiplier,
            timestamp_ms: now_ms,
            detail: String::new(),
        }
    }

    /// Build an escalation event for a key whose multiplier just increased.
    pub fn escalation(scope: Scope, identifier: &str, multiplier: u32, now_ms: u64) -> Self {
        Self {
            kind: EventKind::Escalation,
            scope: Some(scope),
            identifier: redact_identifier(scope, identifier),
            multiplier,
            timestamp_ms: now_ms,
            detail: String::new(),
        }
    }

    /// Build a degraded-mode transition event.
    pub fn degraded_mode(entering: bool, detail: impl Into<String>, now_ms: u64) -> Self {
        Self {
            kind: EventKind::DegradedMode,
            scope: None,
            identifier: String::new(),
            multiplier: 0,
            timestamp_ms: now_ms,
            detail: if entering {
                format!("entered: {}", detail.into())
            } else {
                format!("recovered: {}", detail.into())
            },
        }
    }

    /// Attach free-form detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Redact an identifier for inclusion in an event.
///
/// Sensitive scopes get a truncated SHA-256 digest; IPs and endpoint
/// classes pass through since operators need them legible.
pub fn redact_identifier(scope: Scope, identifier: &str) -> String {
    if !scope.is_sensitive() {
        return identifier.to_string();
    }
    let digest = Sha256::digest(identifier.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_PREFIX_LEN);
    hash
}

/// Destination for security events.
///
/// Implementations must not block: the sink sits on the request path.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: &SecurityEvent);
}

/// Default sink that writes events as structured tracing records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &SecurityEvent) {
        warn!(
            kind = event.kind.as_str(),
            scope = event.scope.map(|s| s.as_str()).unwrap_or("-"),
            identifier = %event.identifier,
            multiplier = event.multiplier,
            timestamp_ms = event.timestamp_ms,
            detail = %event.detail,
            "Security event"
        );
    }
}

/// In-memory sink for tests and inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured events.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    /// Count of captured events of one kind.
    pub fn count_of(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &SecurityEvent) {
        self.events.lock().push(event.clone());
    }
}
