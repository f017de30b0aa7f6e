//! Error types for clawscaler.

use claw_autoscaler::AutoscalerError;
use claw_metrics::MetricsError;
use thiserror::Error;

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, ScalerError>;

/// Errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum ScalerError {
    /// Configuration error.
    #[error("configuration error: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },

    /// Autoscaler error.
    #[error(transparent)]
    Autoscaler(#[from] AutoscalerError),

    /// Metric source error.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// Status server error.
    #[error("status server error: {reason}")]
    Server {
        /// Description of the failure.
        reason: String,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScalerError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
