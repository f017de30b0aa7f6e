//! Error types for the autoscaler system.

use claw_metrics::MetricsError;
use thiserror::Error;

/// Result type for autoscaler operations.
pub type Result<T> = std::result::Result<T, AutoscalerError>;

/// Errors that can occur in the autoscaler system.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutoscalerError {
    /// Invalid scaling policy configuration.
    #[error("invalid scaling policy: {reason}")]
    InvalidPolicy {
        /// Description of why the policy is invalid.
        reason: String,
    },

    /// The policy document as a whole could not be read or parsed.
    #[error("invalid policy document: {reason}")]
    InvalidDocument {
        /// Description of why the document is invalid.
        reason: String,
    },

    /// Sampling or querying metrics failed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// The control plane reports a replica count this autoscaler did not write.
    #[error("conflict on {workload}: expected {expected} replicas, found {found}")]
    Conflict {
        /// Workload identifier.
        workload: String,
        /// Replica count this autoscaler expected.
        expected: u32,
        /// Replica count actually present.
        found: u32,
    },

    /// The control plane could not be reached or rejected the request.
    #[error("control plane error: {reason}")]
    ControlPlane {
        /// Description of the failure.
        reason: String,
    },

    /// The control plane does not know the workload.
    #[error("workload not found: {workload}")]
    WorkloadNotFound {
        /// Workload identifier.
        workload: String,
    },

    /// A reconciliation tick ran past its hard deadline.
    #[error("tick deadline of {deadline_ms}ms exceeded for {workload}")]
    DeadlineExceeded {
        /// Workload identifier.
        workload: String,
        /// Deadline in milliseconds.
        deadline_ms: u64,
    },

    /// The manager task is no longer running.
    #[error("autoscaler manager stopped")]
    ManagerStopped,
}

impl AutoscalerError {
    /// Returns true if this is a metric source infrastructure failure.
    #[must_use]
    pub const fn is_source_failure(&self) -> bool {
        matches!(self, Self::Metrics(e) if e.is_source_failure())
    }

    /// Returns true if the error is a conflict with an external writer.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
