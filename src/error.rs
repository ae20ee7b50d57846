use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("key store still locked after {attempts} attempts")]
    LockTimeout { attempts: u32 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid backend '{spec}': {reason}")]
    InvalidBackend { spec: String, reason: String },
    #[error("backend unreachable: {0}")]
    Gateway(#[source] reqwest::Error),
    #[error("backend did not answer within {0:?}")]
    GatewayTimeout(Duration),
    #[error("backend responded with status {status}")]
    Backend { status: StatusCode },
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::InvalidBackend { .. } => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Backend { status } => *status,
            Self::LockTimeout { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::Gateway(_)
            | Self::GatewayTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message that is safe to hand back to a caller. Internal failures and
    /// backend details are collapsed into generic text; the full error is
    /// expected to be logged by whoever renders the response.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidInput(msg)
            | Self::Conflict(msg)
            | Self::NotFound(msg)
            | Self::Unauthorized(msg) => msg.clone(),
            Self::InvalidBackend { .. } => "invalid backend configuration".to_owned(),
            Self::PayloadTooLarge { .. } => "Payload Too Large".to_owned(),
            Self::Backend { .. } => "Error processing request".to_owned(),
            Self::LockTimeout { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::Gateway(_)
            | Self::GatewayTimeout(_) => "Internal Server Error".to_owned(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.status().is_server_error() && !matches!(self, Self::Backend { .. })
    }
}
