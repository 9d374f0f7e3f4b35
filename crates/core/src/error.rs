//! Delivery error taxonomy.
//!
//! Every failed attempt is classified into one [`ErrorKind`]. The kind decides
//! what the sync engine does next; the message is kept for the user.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed delivery attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connectivity lost, timeout, DNS failure.
    Network,
    /// 5xx or 429 from the server.
    ServerTransient,
    /// 4xx other than auth; the payload will never be accepted as-is.
    ServerValidation,
    /// Credentials expired. Retried once, then treated as permanent.
    AuthExpired,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::ServerTransient => "server_transient",
            ErrorKind::ServerValidation => "server_validation",
            ErrorKind::AuthExpired => "auth_expired",
        }
    }

    /// Whether a failure of this kind is worth retrying with the same payload.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::ServerValidation)
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ErrorKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(ErrorKind::Network),
            "server_transient" => Ok(ErrorKind::ServerTransient),
            "server_validation" => Ok(ErrorKind::ServerValidation),
            "auth_expired" => Ok(ErrorKind::AuthExpired),
            other => Err(ParseKindError(other.to_string())),
        }
    }
}

/// Last classified failure of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct DeliveryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DeliveryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, msg)
    }

    pub fn server_transient(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerTransient, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerValidation, msg)
    }

    pub fn auth_expired(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthExpired, msg)
    }

    /// A delivery that did not finish within the configured timeout.
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::network(format!("delivery timed out after {}ms", after.as_millis()))
    }
}

/// An identifier string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier: {0}")]
pub struct ParseIdError(pub String);

/// A persisted error kind was not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown error kind '{0}'")]
pub struct ParseKindError(pub String);

/// A persisted status was not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entry status '{0}'")]
pub struct ParseStatusError(pub String);
