//! Errors raised by collector adapters.
//!
//! [`CollectorError`] tells the orchestrator how to react: retry locally,
//! back off, switch to a fallback source, or give up on the unit.

use std::time::Duration;

use thiserror::Error;

use crate::error::HarvestError;

#[derive(Debug, Error)]
pub enum CollectorError {
    /// The source answered HTTP 429 or an equivalent quota signal.
    #[error("rate limited{}", retry_hint(.retry_after_ms))]
    RateLimited { retry_after_ms: Option<u64> },

    /// Temporary failure worth retrying (5xx, timeout, dropped connection).
    #[error("transient failure: {0}")]
    Transient(String),

    /// The source refuses service (lockout, revoked key, maintenance).
    #[error("source offline: {0}")]
    Offline(String),

    /// The request itself is bad; retrying the same query will not help.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

fn retry_hint(retry_after_ms: &Option<u64>) -> String {
    match retry_after_ms {
        Some(ms) => format!(", retry after {ms}ms"),
        None => String::new(),
    }
}

impl CollectorError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CollectorError::RateLimited { retry_after_ms } => {
                retry_after_ms.map(Duration::from_millis)
            }
            _ => None,
        }
    }

    /// Map onto the orchestration error taxonomy for `source`.
    pub fn into_harvest_error(self, source: &str) -> HarvestError {
        match self {
            CollectorError::RateLimited { retry_after_ms } => HarvestError::RateLimitExceeded {
                source_name: source.to_string(),
                retry_after_ms,
            },
            CollectorError::Offline(_) => HarvestError::SourceOffline {
                source_name: source.to_string(),
            },
            CollectorError::Rejected(message) => HarvestError::SourceRejected {
                source_name: source.to_string(),
                message,
            },
            other => HarvestError::TransientSource {
                source_name: source.to_string(),
                message: other.to_string(),
            },
        }
    }
}
