//! Error types for the claw-metrics crate.

use thiserror::Error;

/// Errors that can occur in the metrics system.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetricsError {
    /// The metric name is invalid (empty or contains invalid characters).
    #[error("invalid metric name: {reason}")]
    InvalidMetricName {
        /// The reason the name is invalid.
        reason: String,
    },

    /// A series selector could not be parsed.
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector {
        /// The selector text.
        selector: String,
        /// The reason the selector is invalid.
        reason: String,
    },

    /// The time range is invalid (start > end or negative values).
    #[error("invalid time range: start={start}, end={end}")]
    InvalidTimeRange {
        /// Start timestamp.
        start: i64,
        /// End timestamp.
        end: i64,
    },

    /// The source returned no data points for the query in time.
    #[error("metric unavailable: {query}")]
    MetricUnavailable {
        /// The rendered query that produced no data.
        query: String,
    },

    /// Transport, authentication or decoding failure talking to the source.
    #[error("metric source error: {reason}")]
    MetricSource {
        /// Description of the failure.
        reason: String,
    },
}

impl MetricsError {
    /// Returns true for failures of the source infrastructure itself, which
    /// callers back off on rather than simply waiting for the next tick.
    #[must_use]
    pub const fn is_source_failure(&self) -> bool {
        matches!(self, Self::MetricSource { .. })
    }
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;
