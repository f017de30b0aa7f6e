//! Core types for the metrics system.
//!
//! This module provides the fundamental types used throughout the claw-metrics crate:
//! - [`MetricName`]: A validated metric name
//! - [`LabelSet`]: An ordered set of unique label keys and their values
//! - [`MetricSeries`]: Identity, unit and semantics of a time series
//! - [`Observation`]: A single `(timestamp, value)` sample
//! - [`ObservationWindow`]: Sliding-window retention of observations
//! - [`InstanceSeries`]: Observations for one target instance
//! - [`TimeRange`]: A time range for queries

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};

/// Returns the current timestamp in Unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Converts a Duration to milliseconds as i64, saturating at `i64::MAX`.
#[must_use]
pub fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// A validated metric name.
///
/// Metric names must:
/// - Be non-empty
/// - Contain only alphanumeric characters, underscores, and colons
/// - Start with a letter or underscore
/// - Be at most 256 characters long
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricName(String);

impl MetricName {
    /// Maximum allowed length for a metric name.
    pub const MAX_LENGTH: usize = 256;

    /// Creates a new validated metric name.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidMetricName` if the name is invalid.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(MetricsError::InvalidMetricName {
                reason: "metric name cannot be empty".to_string(),
            });
        }

        if name.len() > Self::MAX_LENGTH {
            return Err(MetricsError::InvalidMetricName {
                reason: format!(
                    "metric name exceeds maximum length of {} characters",
                    Self::MAX_LENGTH
                ),
            });
        }

        if let Some(c) = name.chars().next() {
            if !c.is_ascii_alphabetic() && c != '_' {
                return Err(MetricsError::InvalidMetricName {
                    reason: "metric name must start with a letter or underscore".to_string(),
                });
            }
        }

        for c in name.chars() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != ':' {
                return Err(MetricsError::InvalidMetricName {
                    reason: format!("invalid character '{c}' in metric name"),
                });
            }
        }

        Ok(Self(name))
    }

    /// Returns the metric name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MetricName {
    type Error = MetricsError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MetricName> for String {
    fn from(name: MetricName) -> Self {
        name.0
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for MetricName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An ordered label set. Keys are unique by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Creates an empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a label and returns self for chaining. An existing key is replaced.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a label, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value of a label.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns true if every label in `self` is present with the same value in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0.iter().all(|(k, v)| other.get(k) == Some(v.as_str()))
    }

    /// Returns true if there are no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl std::fmt::Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}=\"{v}\"")?;
        }
        write!(f, "}}")
    }
}

/// Identity of a time series: name plus label set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesId {
    /// Metric name.
    pub name: MetricName,
    /// Labels distinguishing this series.
    pub labels: LabelSet,
}

impl SeriesId {
    /// Creates a series identifier.
    #[must_use]
    pub const fn new(name: MetricName, labels: LabelSet) -> Self {
        Self { name, labels }
    }
}

impl std::fmt::Display for SeriesId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.name, self.labels)
    }
}

/// Value semantics of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonically increasing counter (resets to zero on restart).
    Counter,
    /// Point-in-time value.
    #[default]
    Gauge,
}

/// How a metric's aggregate is compared against its per-replica target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    /// Total across instances divided by the current replica count.
    #[default]
    AverageValue,
    /// Already a ratio per instance; averaged, never divided by replicas.
    Utilization,
}

/// Metadata for a time series. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSeries {
    /// Series identity.
    pub id: SeriesId,
    /// Optional unit (e.g. "requests", "percent").
    pub unit: Option<String>,
    /// Counter or gauge semantics.
    pub kind: MetricKind,
}

impl MetricSeries {
    /// Creates series metadata.
    #[must_use]
    pub const fn new(id: SeriesId, kind: MetricKind) -> Self {
        Self {
            id,
            unit: None,
            kind,
        }
    }

    /// Sets the unit.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// A single `(timestamp, value)` sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// The observed value.
    pub value: f64,
}

impl Observation {
    /// Creates an observation.
    #[must_use]
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Creates an observation stamped with the current time.
    #[must_use]
    pub fn now(value: f64) -> Self {
        Self::new(now_millis(), value)
    }
}

/// Observations retained only within a sliding window.
///
/// The window is anchored at the newest observation; anything older than
/// `newest - window` is evicted on push.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationWindow {
    window_millis: i64,
    observations: VecDeque<Observation>,
}

impl ObservationWindow {
    /// Creates an empty window of the given length.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window_millis: duration_to_millis(window),
            observations: VecDeque::new(),
        }
    }

    /// Appends an observation, keeping timestamp order and evicting expired data.
    pub fn push(&mut self, observation: Observation) {
        let pos = self
            .observations
            .iter()
            .rposition(|o| o.timestamp <= observation.timestamp)
            .map_or(0, |p| p + 1);
        self.observations.insert(pos, observation);
        self.evict();
    }

    fn evict(&mut self) {
        let Some(newest) = self.observations.back().map(|o| o.timestamp) else {
            return;
        };
        let cutoff = newest.saturating_sub(self.window_millis);
        while self.observations.front().is_some_and(|o| o.timestamp < cutoff) {
            self.observations.pop_front();
        }
    }

    /// Returns the retained observations, oldest first.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        self.observations.iter().copied().collect()
    }

    /// Returns the number of retained observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Returns true when nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// Observations for a single target instance (pod) of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSeries {
    /// Instance identifier, taken from the instance label.
    pub instance: String,
    /// Full label set of the underlying series.
    pub labels: LabelSet,
    /// Observations in timestamp order.
    pub observations: Vec<Observation>,
}

/// A time range for metric queries.
///
/// Both start and end are inclusive Unix timestamps in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds.
    pub start: i64,
    /// End timestamp (inclusive), in milliseconds.
    pub end: i64,
}

impl TimeRange {
    /// Creates a new time range.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidTimeRange` if start > end.
    pub const fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(MetricsError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Creates a range covering `duration` up to `end`.
    #[must_use]
    pub fn ending_at(end: i64, duration: Duration) -> Self {
        Self {
            start: end.saturating_sub(duration_to_millis(duration)),
            end,
        }
    }

    /// Creates a time range for the last `duration` from now.
    #[must_use]
    pub fn last(duration: Duration) -> Self {
        Self::ending_at(now_millis(), duration)
    }

    /// Returns the duration of this time range in milliseconds.
    #[must_use]
    pub const fn duration_millis(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Checks if a timestamp falls within this range (inclusive).
    #[must_use]
    pub const fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod metric_name_tests {
        use super::*;
        use test_case::test_case;

        #[test_case("gpu_utilization" ; "plain")]
        #[test_case("claw:gpu:utilization" ; "with colons")]
        #[test_case("_internal_metric" ; "leading underscore")]
        #[test_case("http_requests_total" ; "counter style")]
        fn valid_names(name: &str) {
            assert_eq!(MetricName::new(name).unwrap().as_str(), name);
        }

        #[test_case("" ; "empty")]
        #[test_case("0_invalid" ; "leading digit")]
        #[test_case("invalid-name" ; "dash")]
        #[test_case("invalid name" ; "space")]
        fn invalid_names(name: &str) {
            assert!(matches!(
                MetricName::new(name),
                Err(MetricsError::InvalidMetricName { .. })
            ));
        }

        #[test]
        fn metric_name_too_long_fails() {
            let long_name = "a".repeat(MetricName::MAX_LENGTH + 1);
            assert!(MetricName::new(long_name).is_err());
            assert!(MetricName::new("a".repeat(MetricName::MAX_LENGTH)).is_ok());
        }

        #[test]
        fn deserialize_validates() {
            let ok: serde_json::Result<MetricName> = serde_json::from_str("\"pod_cpu\"");
            assert!(ok.is_ok());
            let bad: serde_json::Result<MetricName> = serde_json::from_str("\"pod-cpu\"");
            assert!(bad.is_err());
        }
    }

    mod label_set_tests {
        use super::*;

        #[test]
        fn keys_are_unique() {
            let labels = LabelSet::new().with("app", "web").with("app", "api");
            assert_eq!(labels.len(), 1);
            assert_eq!(labels.get("app"), Some("api"));
        }

        #[test]
        fn subset_matching() {
            let series = LabelSet::new()
                .with("app", "web")
                .with("kubernetes_pod_name", "web-1");
            let target = LabelSet::new().with("app", "web");

            assert!(target.is_subset_of(&series));
            assert!(!series.is_subset_of(&target));
            assert!(LabelSet::new().is_subset_of(&series));
        }

        #[test]
        fn display_is_selector_like() {
            let labels = LabelSet::new().with("b", "2").with("a", "1");
            assert_eq!(labels.to_string(), "{a=\"1\",b=\"2\"}");
        }
    }

    mod window_tests {
        use super::*;

        #[test]
        fn evicts_observations_older_than_window() {
            let mut window = ObservationWindow::new(Duration::from_secs(60));
            window.push(Observation::new(0, 1.0));
            window.push(Observation::new(30_000, 2.0));
            window.push(Observation::new(90_000, 3.0));

            let retained = window.observations();
            assert_eq!(retained.len(), 2);
            assert_eq!(retained[0].timestamp, 30_000);
        }

        #[test]
        fn keeps_timestamp_order_for_late_arrivals() {
            let mut window = ObservationWindow::new(Duration::from_secs(60));
            window.push(Observation::new(20_000, 2.0));
            window.push(Observation::new(10_000, 1.0));
            window.push(Observation::new(30_000, 3.0));

            let ts: Vec<i64> = window.observations().iter().map(|o| o.timestamp).collect();
            assert_eq!(ts, vec![10_000, 20_000, 30_000]);
        }

        #[test]
        fn boundary_observation_is_retained() {
            let mut window = ObservationWindow::new(Duration::from_secs(60));
            window.push(Observation::new(0, 1.0));
            window.push(Observation::new(60_000, 2.0));
            assert_eq!(window.len(), 2);
        }
    }

    mod time_range_tests {
        use super::*;

        #[test]
        fn invalid_range_rejected() {
            assert!(TimeRange::new(100, 50).is_err());
            assert!(TimeRange::new(50, 50).is_ok());
        }

        #[test]
        fn ending_at_covers_duration() {
            let range = TimeRange::ending_at(120_000, Duration::from_secs(60));
            assert_eq!(range.start, 60_000);
            assert_eq!(range.duration_millis(), 60_000);
            assert!(range.contains(60_000));
            assert!(range.contains(120_000));
            assert!(!range.contains(120_001));
        }

        #[test]
        fn huge_duration_saturates() {
            let huge = Duration::from_secs(u64::MAX);
            assert_eq!(duration_to_millis(huge), i64::MAX);

            let range = TimeRange::ending_at(120_000, huge);
            assert!(range.start < 0);
            assert!(range.contains(0));
            assert!(range.duration_millis() > 0);

            let mut window = ObservationWindow::new(huge);
            window.push(Observation::new(-5, 1.0));
            window.push(Observation::new(120_000, 2.0));
            assert_eq!(window.len(), 2);
        }
    }
}
