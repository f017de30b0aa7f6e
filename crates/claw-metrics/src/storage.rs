//! In-memory series storage with retention.
//!
//! This module provides the [`MetricStore`] which keeps observations per
//! series (name plus label set). Retention is anchored at each series' newest
//! observation, so data older than the retention length is evicted on push.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::selector::Selector;
use crate::source::RawSeries;
use crate::types::{
    duration_to_millis, LabelSet, MetricKind, MetricName, MetricSeries, Observation, SeriesId,
    TimeRange,
};

#[derive(Debug)]
struct StoredSeries {
    meta: MetricSeries,
    points: Vec<Observation>,
}

/// Thread-safe in-memory storage for metric series.
///
/// Cloning the store yields a handle onto the same data.
#[derive(Debug, Clone)]
pub struct MetricStore {
    /// The retention duration for observations (in milliseconds).
    retention_millis: i64,
    /// Series keyed by metric name, then label set.
    data: Arc<RwLock<HashMap<MetricName, HashMap<LabelSet, StoredSeries>>>>,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl MetricStore {
    /// Creates a new metric store with the given retention duration.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_millis: duration_to_millis(retention),
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the retention duration in milliseconds.
    #[must_use]
    pub const fn retention_millis(&self) -> i64 {
        self.retention_millis
    }

    /// Registers series metadata.
    ///
    /// Metadata is immutable once registered; re-registering an existing
    /// series is a no-op and returns `false`.
    pub fn register(&self, series: MetricSeries) -> bool {
        let mut data = self.data.write();
        let by_labels = data.entry(series.id.name.clone()).or_default();
        if by_labels.contains_key(&series.id.labels) {
            return false;
        }
        by_labels.insert(
            series.id.labels.clone(),
            StoredSeries {
                meta: series,
                points: Vec::new(),
            },
        );
        true
    }

    /// Appends an observation to a series, registering it as a gauge if unknown.
    ///
    /// The point is inserted in timestamp order and observations older than
    /// the retention length (relative to the newest one) are dropped.
    #[allow(clippy::significant_drop_tightening)] // Lock needed for multi-step atomic operation
    pub fn push(&self, id: &SeriesId, observation: Observation) {
        let mut data = self.data.write();
        let series = data
            .entry(id.name.clone())
            .or_default()
            .entry(id.labels.clone())
            .or_insert_with(|| StoredSeries {
                meta: MetricSeries::new(id.clone(), MetricKind::Gauge),
                points: Vec::new(),
            });

        let insert_pos = series
            .points
            .binary_search_by_key(&observation.timestamp, |p| p.timestamp)
            .unwrap_or_else(|pos| pos);
        series.points.insert(insert_pos, observation);

        if let Some(newest) = series.points.last().map(|p| p.timestamp) {
            let cutoff = newest.saturating_sub(self.retention_millis);
            series.points.retain(|p| p.timestamp >= cutoff);
        }

        debug!(
            series = %id,
            points_count = series.points.len(),
            "pushed observation"
        );
    }

    /// Appends several observations to one series.
    pub fn push_all(&self, id: &SeriesId, observations: impl IntoIterator<Item = Observation>) {
        for observation in observations {
            self.push(id, observation);
        }
    }

    /// Returns every series matching `selector`, restricted to `range`.
    ///
    /// Series with no observations in range are omitted.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature matches the source contract.
    pub fn query(&self, selector: &Selector, range: TimeRange) -> Result<Vec<RawSeries>> {
        let data = self.data.read();
        let Some(by_labels) = data.get(&selector.name) else {
            return Ok(Vec::new());
        };

        let mut result: Vec<RawSeries> = by_labels
            .values()
            .filter(|s| selector.matchers.is_subset_of(&s.meta.id.labels))
            .filter_map(|s| {
                let points: Vec<Observation> = s
                    .points
                    .iter()
                    .filter(|p| range.contains(p.timestamp))
                    .copied()
                    .collect();
                (!points.is_empty()).then(|| RawSeries {
                    labels: s.meta.id.labels.clone(),
                    observations: points,
                })
            })
            .collect();
        drop(data);

        result.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(result)
    }

    /// Returns the registered metadata for a series.
    #[must_use]
    pub fn series(&self, id: &SeriesId) -> Option<MetricSeries> {
        let data = self.data.read();
        data.get(&id.name)
            .and_then(|m| m.get(&id.labels))
            .map(|s| s.meta.clone())
    }

    /// Returns the number of observations held for a series.
    #[must_use]
    pub fn observation_count(&self, id: &SeriesId) -> usize {
        let data = self.data.read();
        data.get(&id.name)
            .and_then(|m| m.get(&id.labels))
            .map_or(0, |s| s.points.len())
    }

    /// Removes all series.
    pub fn clear(&self) {
        self.data.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series_id(pod: &str) -> SeriesId {
        SeriesId::new(
            MetricName::new("http_requests_total").unwrap(),
            LabelSet::new()
                .with("app", "web")
                .with("kubernetes_pod_name", pod),
        )
    }

    #[test]
    fn register_is_immutable() {
        let store = MetricStore::default();
        let id = series_id("web-0");

        assert!(store.register(MetricSeries::new(id.clone(), MetricKind::Counter)));
        assert!(!store.register(MetricSeries::new(id.clone(), MetricKind::Gauge)));
        assert_eq!(store.series(&id).unwrap().kind, MetricKind::Counter);
    }

    #[test]
    fn push_maintains_order_and_retention() {
        let store = MetricStore::new(Duration::from_secs(60));
        let id = series_id("web-0");

        store.push(&id, Observation::new(30_000, 3.0));
        store.push(&id, Observation::new(10_000, 1.0));
        store.push(&id, Observation::new(20_000, 2.0));
        assert_eq!(store.observation_count(&id), 3);

        store.push(&id, Observation::new(85_000, 4.0));
        // 10_000 and 20_000 fall outside 60s of 85_000.
        assert_eq!(store.observation_count(&id), 2);
    }

    #[test]
    fn query_filters_by_selector_and_range() {
        let store = MetricStore::default();
        store.push_all(
            &series_id("web-0"),
            [Observation::new(1_000, 1.0), Observation::new(2_000, 2.0)],
        );
        store.push_all(&series_id("web-1"), [Observation::new(1_500, 5.0)]);

        let selector = Selector::parse(r#"http_requests_total{app="web"}"#).unwrap();
        let all = store.query(&selector, TimeRange::new(0, 10_000).unwrap()).unwrap();
        assert_eq!(all.len(), 2);

        let narrow = store
            .query(&selector, TimeRange::new(1_800, 10_000).unwrap())
            .unwrap();
        assert_eq!(narrow.len(), 1);
        assert_eq!(narrow[0].labels.get("kubernetes_pod_name"), Some("web-0"));

        let pod = selector.with_labels(&LabelSet::new().with("kubernetes_pod_name", "web-1"));
        let one = store.query(&pod, TimeRange::new(0, 10_000).unwrap()).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].observations.len(), 1);
    }

    #[test]
    fn unknown_metric_yields_empty() {
        let store = MetricStore::default();
        let selector = Selector::parse("missing_metric").unwrap();
        let result = store.query(&selector, TimeRange::new(0, 1).unwrap()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn clones_share_data() {
        let store = MetricStore::default();
        let clone = store.clone();
        let id = series_id("web-0");
        store.push(&id, Observation::new(1, 1.0));
        assert_eq!(clone.observation_count(&id), 1);
        clone.clear();
        assert_eq!(store.observation_count(&id), 0);
    }
}
