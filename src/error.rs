//! Error types for the posture fusion core

use crate::types::EstimateSource;
use thiserror::Error;

/// Errors that can occur while configuring or ticking the fusion core
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("No estimate available from any source")]
    NoEstimateAvailable,

    #[error("{0} estimator timed out")]
    EstimatorTimeout(EstimateSource),

    #[error("{estimator} estimator failed: {reason}")]
    EstimatorFailed {
        estimator: EstimateSource,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid estimate: {0}")]
    InvalidEstimate(String),

    #[error("Invalid sensor reading: {0}")]
    InvalidReading(String),

    #[error("Tick {ticket} was superseded by tick {latest}")]
    SupersededTick { ticket: u64, latest: u64 },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
