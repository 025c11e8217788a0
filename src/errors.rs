//! # Error Types
//!
//! Fatal error taxonomy for the resolution engine. Non-fatal conditions are
//! not errors: they accumulate as [`crate::model::Warning`]s on the run summary.

use thiserror::Error;

use crate::model::Stage;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or missing rule/engine configuration. Raised before any
    /// processing; no state is mutated.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stage's output failed to persist. The run is marked FAILED and no
    /// partial stage commit is left visible.
    #[error("Storage error in {stage} stage: {message}")]
    Storage { stage: Stage, message: String },

    /// Another run already holds the durable state.
    #[error("Concurrent run detected: {0}")]
    ConcurrentRun(String),

    /// An internal invariant broke mid-run.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stage attributed to this error, when one applies.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EngineError::Configuration(_) | EngineError::ConcurrentRun(_) => Some(Stage::Preflight),
            EngineError::Storage { stage, .. } => Some(*stage),
            EngineError::Internal(_) => None,
        }
    }
}

impl From<figment::Error> for EngineError {
    fn from(err: figment::Error) -> Self {
        EngineError::Configuration(err.to_string())
    }
}
