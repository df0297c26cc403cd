use std::time::Duration;

use crate::models::{EstimateId, EstimateStatus};

/// Errors surfaced by the estimate store and the trigger engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("estimate {id} is {status}, only listening estimates can be modified")]
    InvalidState {
        id: EstimateId,
        status: EstimateStatus,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Failures reported by the execution gateway
///
/// None of these are retried: the dispatcher records the reason on the
/// estimate and moves it to `failed`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Exchange-side refusal (insufficient balance, invalid leverage, halted symbol, ...)
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Short reason string stored on a failed estimate
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(format!("serialization: {}", err))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(Duration::ZERO)
        } else {
            GatewayError::Unavailable(err.to_string())
        }
    }
}
