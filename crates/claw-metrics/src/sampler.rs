//! Metric sampling for a scale target.
//!
//! The [`Sampler`] turns a [`SeriesQuery`] plus the label set of a scale
//! target into per-instance observation lists, bounded by a query timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MetricsError, Result};
use crate::selector::Selector;
use crate::source::MetricSource;
use crate::types::{now_millis, InstanceSeries, LabelSet, TimeRange};

/// Default label identifying the instance (pod) a series belongs to.
pub const DEFAULT_INSTANCE_LABEL: &str = "kubernetes_pod_name";

/// Default upper bound on a single source query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// What to fetch for one metric target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesQuery {
    /// Series selector.
    pub selector: Selector,
    /// Lookback window.
    #[serde(with = "duration_secs")]
    pub window: Duration,
    /// Label whose value identifies the instance.
    #[serde(default = "default_instance_label")]
    pub instance_label: String,
}

fn default_instance_label() -> String {
    DEFAULT_INSTANCE_LABEL.to_string()
}

impl SeriesQuery {
    /// Creates a query with the default instance label.
    #[must_use]
    pub fn new(selector: Selector, window: Duration) -> Self {
        Self {
            selector,
            window,
            instance_label: default_instance_label(),
        }
    }

    /// Overrides the instance label.
    #[must_use]
    pub fn with_instance_label(mut self, label: impl Into<String>) -> Self {
        self.instance_label = label.into();
        self
    }
}

/// Fetches observations for scale targets from a [`MetricSource`].
#[derive(Clone)]
pub struct Sampler {
    source: Arc<dyn MetricSource>,
    timeout: Duration,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("source", &self.source.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Sampler {
    /// Creates a sampler with the default query timeout.
    #[must_use]
    pub fn new(source: Arc<dyn MetricSource>) -> Self {
        Self {
            source,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Sets the query timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the query timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the underlying source.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn MetricSource> {
        &self.source
    }

    /// Samples `query` for `target` over the window ending now.
    ///
    /// # Errors
    ///
    /// See [`Sampler::sample_at`].
    pub async fn sample(
        &self,
        query: &SeriesQuery,
        target: &LabelSet,
    ) -> Result<Vec<InstanceSeries>> {
        self.sample_at(query, target, now_millis()).await
    }

    /// Samples `query` for `target` over the window ending at `end` (Unix ms).
    ///
    /// Only series whose labels are a superset of `target` are returned, one
    /// [`InstanceSeries`] per matching series.
    ///
    /// # Errors
    ///
    /// - `MetricsError::MetricUnavailable` when nothing matches or the query
    ///   does not complete within the timeout
    /// - `MetricsError::MetricSource` when the source itself fails
    pub async fn sample_at(
        &self,
        query: &SeriesQuery,
        target: &LabelSet,
        end: i64,
    ) -> Result<Vec<InstanceSeries>> {
        let selector = query.selector.with_labels(target);
        let range = TimeRange::ending_at(end, query.window);

        let raw = match tokio::time::timeout(self.timeout, self.source.query_range(&selector, range))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    source = self.source.name(),
                    selector = %selector,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "metric query timed out"
                );
                return Err(MetricsError::MetricUnavailable {
                    query: selector.to_string(),
                });
            }
        };

        let instances: Vec<InstanceSeries> = raw
            .into_iter()
            .filter(|s| target.is_subset_of(&s.labels) && !s.observations.is_empty())
            .map(|s| {
                let instance = s
                    .labels
                    .get(&query.instance_label)
                    .map_or_else(|| s.labels.to_string(), str::to_string);
                let mut observations = s.observations;
                observations.sort_by_key(|o| o.timestamp);
                InstanceSeries {
                    instance,
                    labels: s.labels,
                    observations,
                }
            })
            .collect();

        if instances.is_empty() {
            return Err(MetricsError::MetricUnavailable {
                query: selector.to_string(),
            });
        }

        debug!(
            selector = %selector,
            instances = instances.len(),
            "sampled metric"
        );
        Ok(instances)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
