//! Typed error hierarchy for the LOS service.
//!
//! Three enums cover the layers that need matchable failures:
//! - `ConfigError`: configuration loading and validation
//! - `ServiceError`: domain failures surfaced by the HTTP layer
//! - `PushError`: Web Push delivery outcomes
//!
//! Infrastructure failures (SQLite, IO) travel as `anyhow::Error` with
//! context and are folded into `ServiceError::Internal` at the edge.

use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required setting {key} (set {env} or add it to los.toml)")]
    Missing { key: String, env: String },
}

/// Domain errors returned by services and handlers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    /// `bearer_challenge` adds `WWW-Authenticate: Bearer` to the response.
    #[error("{message}")]
    Unauthorized {
        message: String,
        bearer_challenge: bool,
    },

    #[error("{0}")]
    Forbidden(String),

    /// A business rule rejected the write (duplicate email, category limit).
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
            bearer_challenge: false,
        }
    }

    pub fn credentials() -> Self {
        Self::Unauthorized {
            message: "Could not validate credentials".to_string(),
            bearer_challenge: true,
        }
    }
}

/// Failures delivering a Web Push message.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("Push notifications are not configured (VAPID keys missing)")]
    NotConfigured,

    #[error("Invalid VAPID key: {0}")]
    InvalidKey(String),

    #[error("Invalid push endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to encrypt push payload: {0}")]
    Encryption(String),

    /// The push service says the subscription no longer exists.
    #[error("Push subscription expired (HTTP {status})")]
    Gone { status: u16 },

    #[error("Push service rejected the message (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Push request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl PushError {
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }
}

/// Domain errors raised inside `DbHandle::call` closures travel through
/// `anyhow` and are recovered here; anything else is internal.
impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<ServiceError>() {
            Ok(domain) => domain,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "internal error");
                Self::Internal(e.to_string())
            }
        }
    }
}
