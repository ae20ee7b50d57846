//! Model-aware LLM relay: routes OpenAI-style requests to the backend that
//! serves the requested model, authenticates callers with issued API keys and
//! records per-key usage intervals.

pub mod auth;
pub mod error;
pub mod forward;
pub mod keys;
pub mod models;
pub mod server;
pub mod usage;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::{AuthGate, SessionVerifier, UsageTicket};
pub use error::RelayError;
pub use forward::{Forwarded, ForwardingProxy, ProxyRequest, ProxyResponse, RelayOutcome};
pub use keys::{KeyRecord, KeyStore};
pub use models::{Backend, ModelEntry, ModelRegistry};
pub use server::AppState;
pub use usage::{UsageLog, UsageRecord};

/// Milliseconds per day, the unit analytics windows are expressed in.
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
