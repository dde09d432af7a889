use thiserror::Error;

use crate::work::UnitStatus;

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Transient error from source {source_name}: {message}")]
    TransientSource {
        source_name: String,
        message: String,
    },

    #[error("Rate limit exceeded for source {source_name}")]
    RateLimitExceeded {
        source_name: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Source {source_name} is offline")]
    SourceOffline { source_name: String },

    #[error("Source {source_name} rejected the query: {message}")]
    SourceRejected {
        source_name: String,
        message: String,
    },

    #[error("Corrupt checkpoint {checkpoint} in session {session_id}: {reason}")]
    CorruptCheckpoint {
        session_id: String,
        checkpoint: String,
        reason: String,
    },

    #[error("Data integrity failure in session {session_id} (score {integrity_score:.2})")]
    DataIntegrity {
        session_id: String,
        integrity_score: f64,
        recommendations: Vec<String>,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Work unit {unit_id} cannot move from {from} to {to}")]
    InvalidTransition {
        unit_id: String,
        from: UnitStatus,
        to: UnitStatus,
    },

    #[error("Invalid work plan: {0}")]
    InvalidPlan(String),

    #[error("Collection cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl HarvestError {
    /// Unit-level errors fail a single work unit; everything else halts dispatch.
    pub fn is_unit_level(&self) -> bool {
        matches!(
            self,
            HarvestError::TransientSource { .. }
                | HarvestError::RateLimitExceeded { .. }
                | HarvestError::SourceOffline { .. }
                | HarvestError::SourceRejected { .. }
                | HarvestError::InvalidTransition { .. }
        )
    }
}
