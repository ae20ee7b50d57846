use std::{fmt, sync::Arc};

use axum::http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::debug;

use crate::{
    error::RelayError,
    forward::RelayOutcome,
    keys::{KeyRecord, KeyStore},
    now_millis,
    usage::UsageLog,
};

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Verifies HS256 session tokens for the admin routes.
///
/// Only the signature and the `alg` header are checked. Expiry claims are
/// ignored and token issuance happens elsewhere.
#[derive(Clone)]
pub struct SessionVerifier {
    key: Arc<DecodingKey>,
    validation: Validation,
}

impl fmt::Debug for SessionVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionVerifier").finish_non_exhaustive()
    }
}

impl SessionVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Self {
            key: Arc::new(DecodingKey::from_secret(secret.as_ref())),
            validation,
        }
    }

    /// Returns the token's claims when its signature is valid.
    pub fn verify(&self, token: &str) -> Result<Value, RelayError> {
        jsonwebtoken::decode::<Value>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| {
                debug!(error = %err, "rejected session token");
                RelayError::Unauthorized("Invalid token".to_owned())
            })
    }
}

/// Authenticates API callers and feeds their request intervals to the usage
/// log.
#[derive(Debug, Clone)]
pub struct AuthGate {
    keys: Arc<KeyStore>,
    usage: Arc<UsageLog>,
}

impl AuthGate {
    pub fn new(keys: Arc<KeyStore>, usage: Arc<UsageLog>) -> Self {
        Self { keys, usage }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<KeyRecord, RelayError> {
        let secret = bearer_token(headers).ok_or_else(|| {
            RelayError::Unauthorized("Missing or invalid Authorization header".to_owned())
        })?;
        self.keys
            .validate(secret)
            .await
            .ok_or_else(|| RelayError::Unauthorized("Invalid API key".to_owned()))
    }

    /// Starts timing one request made with `secret`.
    pub fn track(&self, secret: &str) -> UsageTicket {
        UsageTicket {
            usage: self.usage.clone(),
            secret: secret.to_owned(),
            started_at: now_millis(),
        }
    }
}

/// An in-flight request whose interval has not been recorded yet.
#[derive(Debug)]
pub struct UsageTicket {
    usage: Arc<UsageLog>,
    secret: String,
    started_at: i64,
}

impl UsageTicket {
    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// Records the interval in the background. A failed append is logged by
    /// the usage log and otherwise ignored.
    pub fn finish(self, end_time: Option<i64>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self
                .usage
                .record(&self.secret, self.started_at, end_time)
                .await
            {
                debug!(error = %err, "usage record dropped");
            }
        })
    }

    /// Records once the relay reports how it ended. Only a completed relay
    /// gets an end time.
    pub fn watch(self, done: oneshot::Receiver<RelayOutcome>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let outcome = done.await.unwrap_or(RelayOutcome::Cancelled);
            let end_time = match outcome {
                RelayOutcome::Completed => Some(now_millis()),
                RelayOutcome::Failed | RelayOutcome::Cancelled => None,
            };
            debug!(?outcome, "relay finished");
            if let Err(err) = self
                .usage
                .record(&self.secret, self.started_at, end_time)
                .await
            {
                debug!(error = %err, "usage record dropped");
            }
        })
    }
}
