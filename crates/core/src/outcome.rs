//! Result of a single delivery attempt.

use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, ErrorKind};

/// What the server made of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum Outcome {
    /// Accepted, or already applied under the same idempotency key.
    Success,
    /// Worth trying again later with the same payload.
    RetryableFailure(DeliveryError),
    /// Will never succeed as-is.
    PermanentFailure(DeliveryError),
}

impl Outcome {
    pub fn retryable(error: DeliveryError) -> Self {
        Self::RetryableFailure(error)
    }

    pub fn permanent(error: DeliveryError) -> Self {
        Self::PermanentFailure(error)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn error(&self) -> Option<&DeliveryError> {
        match self {
            Outcome::Success => None,
            Outcome::RetryableFailure(e) | Outcome::PermanentFailure(e) => Some(e),
        }
    }

    /// Classify an HTTP response status.
    ///
    /// 409 means the idempotency key was already applied and counts as success.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            200..=299 | 409 => Outcome::Success,
            401 => Outcome::RetryableFailure(DeliveryError::new(ErrorKind::AuthExpired, message)),
            408 => Outcome::RetryableFailure(DeliveryError::new(ErrorKind::Network, message)),
            429 | 500..=599 => {
                Outcome::RetryableFailure(DeliveryError::new(ErrorKind::ServerTransient, message))
            }
            400..=499 => {
                Outcome::PermanentFailure(DeliveryError::new(ErrorKind::ServerValidation, message))
            }
            // 1xx/3xx reaching here means the client did not follow through.
            _ => Outcome::RetryableFailure(DeliveryError::new(ErrorKind::ServerTransient, message)),
        }
    }
}
