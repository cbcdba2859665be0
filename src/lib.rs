//! Warden - Distributed Rate Limiting and Abuse Prevention Engine
//!
//! This crate implements the throttling and penalty decision engine for a
//! horizontally-scaled service: sliding-window limits across multiple
//! dimensions (IP, account, credential, endpoint class, global), escalating
//! lockouts for repeat offenders, and a shared backing store with automatic
//! local fallback when it degrades. Routing, tier lookup, and event storage
//! are external collaborators reached through traits.

pub mod config;
pub mod error;
pub mod events;
pub mod limit;
pub mod policy;
pub mod store;

pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use limit::{Decision, RateLimitGate};
pub use policy::{Policy, RequestIdentity, Scope};
