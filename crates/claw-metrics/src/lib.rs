//! Metric sampling and windowed aggregation for Clawbernetes autoscaling.
#![forbid(unsafe_code)]
//!
//! `claw-metrics` fetches time series for a scale target from a metric
//! backend and reduces them to the scalar an autoscaling policy compares
//! against its target.
//!
//! # Features
//!
//! - **Sources**: a [`MetricSource`] trait with an in-memory store for tests
//!   and dry runs, plus a Prometheus HTTP API client
//! - **Sampling**: selector-plus-target-labels queries bounded by a timeout
//! - **Aggregation**: counter rates with reset handling, gauge means, and
//!   per-replica normalization
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use claw_metrics::{
//!     aggregate_series, Aggregate, MetricKind, Observation,
//! };
//!
//! let observations = vec![
//!     Observation::new(0, 0.0),
//!     Observation::new(30_000, 30.0),
//!     Observation::new(60_000, 60.0),
//! ];
//! let rate = aggregate_series(&observations, Duration::from_secs(60), MetricKind::Counter);
//! assert_eq!(rate, Aggregate::Value(1.0));
//! ```

#![doc(html_root_url = "https://docs.rs/claw-metrics/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod aggregate;
pub mod error;
pub mod prometheus;
pub mod sampler;
pub mod selector;
pub mod source;
pub mod storage;
pub mod types;

// Re-export main types at crate root
pub use aggregate::{aggregate, aggregate_series, Aggregate, AggregationSpec};
pub use error::{MetricsError, Result};
pub use prometheus::{PrometheusConfig, PrometheusSource};
pub use sampler::{Sampler, SeriesQuery, DEFAULT_INSTANCE_LABEL, DEFAULT_QUERY_TIMEOUT};
pub use selector::Selector;
pub use source::{BoxFuture, InMemorySource, MetricSource, RawSeries};
pub use storage::MetricStore;
pub use types::{
    now_millis, ComparisonMode, InstanceSeries, LabelSet, MetricKind, MetricName, MetricSeries,
    Observation, ObservationWindow, SeriesId, TimeRange,
};
