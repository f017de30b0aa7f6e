//! Windowed rate and mean aggregation.
//!
//! Counters are turned into per-second rates, gauges into arithmetic means.
//! Per-instance results are then combined according to the target's
//! [`ComparisonMode`] and multiplied by its scale factor.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{duration_to_millis, ComparisonMode, InstanceSeries, MetricKind, Observation};

/// Result of aggregating observations.
///
/// `InsufficientData` is a valid "do nothing" signal and must never be read
/// as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Aggregate {
    /// A computed value.
    Value(f64),
    /// Not enough observations to compute a value.
    InsufficientData,
}

impl Aggregate {
    /// Returns the value, if any.
    #[must_use]
    pub const fn value(self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(v),
            Self::InsufficientData => None,
        }
    }

    /// Returns true for `InsufficientData`.
    #[must_use]
    pub const fn is_insufficient(self) -> bool {
        matches!(self, Self::InsufficientData)
    }
}

/// How a metric target's observations are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// Sliding window, anchored at the newest observation of each series.
    pub window: Duration,
    /// Counter or gauge semantics.
    pub kind: MetricKind,
    /// How instances are combined.
    pub mode: ComparisonMode,
    /// Multiplier applied to the combined value (60 turns a per-second rate
    /// into a per-minute rate).
    pub scale_factor: f64,
}

impl AggregationSpec {
    /// Creates a spec with a scale factor of 1.
    #[must_use]
    pub const fn new(window: Duration, kind: MetricKind, mode: ComparisonMode) -> Self {
        Self {
            window,
            kind,
            mode,
            scale_factor: 1.0,
        }
    }

    /// Sets the scale factor.
    #[must_use]
    pub const fn with_scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }
}

/// Aggregates one series over `window`.
///
/// The window ends at the newest observation. Counter resets are handled by
/// summing monotonic increases; after a drop the new value counts as the
/// increase.
#[must_use]
pub fn aggregate_series(observations: &[Observation], window: Duration, kind: MetricKind) -> Aggregate {
    let mut points: Vec<Observation> = observations
        .iter()
        .filter(|o| o.value.is_finite())
        .copied()
        .collect();
    points.sort_by_key(|o| o.timestamp);

    let Some(newest) = points.last().map(|o| o.timestamp) else {
        return Aggregate::InsufficientData;
    };
    let cutoff = newest.saturating_sub(duration_to_millis(window));
    points.retain(|o| o.timestamp >= cutoff);

    if points.len() < 2 {
        return Aggregate::InsufficientData;
    }

    match kind {
        MetricKind::Gauge => {
            let sum: f64 = points.iter().map(|o| o.value).sum();
            Aggregate::Value(sum / points.len() as f64)
        }
        MetricKind::Counter => {
            let first = points[0].timestamp;
            let last = points[points.len() - 1].timestamp;
            let elapsed_secs = (last - first) as f64 / 1000.0;
            if elapsed_secs <= 0.0 {
                return Aggregate::InsufficientData;
            }

            let increase: f64 = points
                .windows(2)
                .map(|pair| {
                    let delta = pair[1].value - pair[0].value;
                    if delta >= 0.0 { delta } else { pair[1].value }
                })
                .sum();
            Aggregate::Value(increase / elapsed_secs)
        }
    }
}

/// Aggregates sampled instances into the value compared against a target.
///
/// Series sharing an instance are summed. Instances without enough data
/// carry zero weight.
///
/// - `AverageValue`: sum over instances divided by `current_replicas` (at least 1)
/// - `Utilization`: mean over contributing instances
#[must_use]
pub fn aggregate(
    instances: &[InstanceSeries],
    spec: &AggregationSpec,
    current_replicas: u32,
) -> Aggregate {
    let mut per_instance: BTreeMap<&str, f64> = BTreeMap::new();
    for series in instances {
        if let Aggregate::Value(v) = aggregate_series(&series.observations, spec.window, spec.kind) {
            *per_instance.entry(series.instance.as_str()).or_insert(0.0) += v;
        }
    }

    if per_instance.is_empty() {
        return Aggregate::InsufficientData;
    }

    let total: f64 = per_instance.values().sum();
    let combined = match spec.mode {
        ComparisonMode::AverageValue => total / f64::from(current_replicas.max(1)),
        ComparisonMode::Utilization => total / per_instance.len() as f64,
    };

    Aggregate::Value(combined * spec.scale_factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LabelSet;

    fn linear(start_ts: i64, step_ms: i64, per_step: f64, n: usize) -> Vec<Observation> {
        (0..n)
            .map(|i| {
                let i = i as i64;
                Observation::new(start_ts + i * step_ms, per_step * i as f64)
            })
            .collect()
    }

    fn instance(name: &str, observations: Vec<Observation>) -> InstanceSeries {
        InstanceSeries {
            instance: name.to_string(),
            labels: LabelSet::new().with("kubernetes_pod_name", name),
            observations,
        }
    }

    mod series_tests {
        use super::*;
        use test_case::test_case;

        #[test]
        fn huge_window_keeps_every_point() {
            let obs = linear(0, 15_000, 15.0, 5);
            let rate = aggregate_series(&obs, Duration::from_secs(u64::MAX), MetricKind::Counter);
            assert!((rate.value().unwrap() - 1.0).abs() < 1e-9);
        }

        #[test]
        fn counter_linear_sixty_over_sixty_seconds_is_one_per_second() {
            let obs = linear(0, 15_000, 15.0, 5);
            assert_eq!(obs[4].value, 60.0);
            let rate = aggregate_series(&obs, Duration::from_secs(60), MetricKind::Counter);
            let v = rate.value().unwrap();
            assert!((v - 1.0).abs() < 1e-9, "rate was {v}");
        }

        #[test]
        fn counter_reset_counts_post_reset_value() {
            let obs = vec![
                Observation::new(0, 100.0),
                Observation::new(10_000, 110.0),
                Observation::new(20_000, 5.0),
                Observation::new(30_000, 15.0),
            ];
            // increases: 10 + 5 + 10 = 25 over 30s
            let v = aggregate_series(&obs, Duration::from_secs(60), MetricKind::Counter)
                .value()
                .unwrap();
            assert!((v - 25.0 / 30.0).abs() < 1e-9);
        }

        #[test]
        fn gauge_is_mean() {
            let obs = vec![
                Observation::new(0, 40.0),
                Observation::new(10_000, 60.0),
                Observation::new(20_000, 50.0),
            ];
            let agg = aggregate_series(&obs, Duration::from_secs(60), MetricKind::Gauge);
            assert_eq!(agg, Aggregate::Value(50.0));
        }

        #[test]
        fn window_anchored_at_newest() {
            let obs = vec![
                Observation::new(0, 1000.0),
                Observation::new(100_000, 10.0),
                Observation::new(130_000, 20.0),
            ];
            // Only the last two fall inside 60s of 130_000.
            let agg = aggregate_series(&obs, Duration::from_secs(60), MetricKind::Gauge);
            assert_eq!(agg, Aggregate::Value(15.0));
        }

        #[test_case(MetricKind::Counter ; "counter")]
        #[test_case(MetricKind::Gauge ; "gauge")]
        fn fewer_than_two_is_insufficient(kind: MetricKind) {
            assert!(aggregate_series(&[], Duration::from_secs(60), kind).is_insufficient());
            assert!(
                aggregate_series(&[Observation::new(0, 5.0)], Duration::from_secs(60), kind)
                    .is_insufficient()
            );
        }

        #[test]
        fn counter_zero_elapsed_is_insufficient() {
            let obs = vec![Observation::new(5_000, 1.0), Observation::new(5_000, 2.0)];
            assert!(
                aggregate_series(&obs, Duration::from_secs(60), MetricKind::Counter)
                    .is_insufficient()
            );
        }

        #[test]
        fn flat_counter_is_zero_not_insufficient() {
            let obs = vec![Observation::new(0, 7.0), Observation::new(30_000, 7.0)];
            assert_eq!(
                aggregate_series(&obs, Duration::from_secs(60), MetricKind::Counter),
                Aggregate::Value(0.0)
            );
        }

        #[test]
        fn unsorted_input_is_ordered_first() {
            let obs = vec![Observation::new(60_000, 60.0), Observation::new(0, 0.0)];
            assert_eq!(
                aggregate_series(&obs, Duration::from_secs(60), MetricKind::Counter),
                Aggregate::Value(1.0)
            );
        }
    }

    mod combine_tests {
        use super::*;

        #[test]
        fn average_value_divides_by_replicas_and_scales() {
            // Two pods each at 1 req/s, per-minute target.
            let instances = vec![
                instance("go-1", linear(0, 15_000, 15.0, 5)),
                instance("go-2", linear(0, 15_000, 15.0, 5)),
            ];
            let spec = AggregationSpec::new(
                Duration::from_secs(60),
                MetricKind::Counter,
                ComparisonMode::AverageValue,
            )
            .with_scale_factor(60.0);

            let v = aggregate(&instances, &spec, 2).value().unwrap();
            assert!((v - 60.0).abs() < 1e-9);

            // A missing third pod still divides by the current replica count.
            let v = aggregate(&instances, &spec, 3).value().unwrap();
            assert!((v - 40.0).abs() < 1e-9);
        }

        #[test]
        fn utilization_is_mean_of_contributing_instances() {
            let instances = vec![
                instance("a", vec![Observation::new(0, 40.0), Observation::new(10_000, 40.0)]),
                instance("b", vec![Observation::new(0, 80.0), Observation::new(10_000, 80.0)]),
                instance("c", vec![Observation::new(10_000, 99.0)]),
            ];
            let spec = AggregationSpec::new(
                Duration::from_secs(60),
                MetricKind::Gauge,
                ComparisonMode::Utilization,
            );
            assert_eq!(aggregate(&instances, &spec, 5), Aggregate::Value(60.0));
        }

        #[test]
        fn series_of_same_instance_are_summed() {
            let instances = vec![
                instance("web-0", linear(0, 10_000, 10.0, 4)),
                instance("web-0", linear(0, 10_000, 20.0, 4)),
            ];
            let spec = AggregationSpec::new(
                Duration::from_secs(60),
                MetricKind::Counter,
                ComparisonMode::Utilization,
            );
            let v = aggregate(&instances, &spec, 1).value().unwrap();
            assert!((v - 3.0).abs() < 1e-9);
        }

        #[test]
        fn zero_replicas_treated_as_one() {
            let instances = vec![instance(
                "a",
                vec![Observation::new(0, 10.0), Observation::new(1_000, 10.0)],
            )];
            let spec = AggregationSpec::new(
                Duration::from_secs(60),
                MetricKind::Gauge,
                ComparisonMode::AverageValue,
            );
            assert_eq!(aggregate(&instances, &spec, 0), Aggregate::Value(10.0));
        }

        #[test]
        fn no_contributing_instance_is_insufficient() {
            let instances = vec![instance("a", vec![Observation::new(0, 10.0)])];
            let spec = AggregationSpec::new(
                Duration::from_secs(60),
                MetricKind::Gauge,
                ComparisonMode::AverageValue,
            );
            assert!(aggregate(&instances, &spec, 2).is_insufficient());
            assert!(aggregate(&[], &spec, 2).is_insufficient());
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn gauge_mean_within_bounds(values in prop::collection::vec(-1e6f64..1e6, 2..50)) {
                let obs: Vec<Observation> = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Observation::new(i as i64 * 1_000, *v))
                    .collect();
                let mean = aggregate_series(&obs, Duration::from_secs(3600), MetricKind::Gauge)
                    .value()
                    .unwrap();
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                prop_assert!(mean >= min - 1e-6 && mean <= max + 1e-6);
            }

            #[test]
            fn counter_rate_never_negative(values in prop::collection::vec(0f64..1e6, 2..50)) {
                let obs: Vec<Observation> = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Observation::new(i as i64 * 1_000, *v))
                    .collect();
                let rate = aggregate_series(&obs, Duration::from_secs(3600), MetricKind::Counter)
                    .value()
                    .unwrap();
                prop_assert!(rate >= 0.0);
            }

            #[test]
            fn linear_counter_rate_matches_slope(slope in 0.0f64..1000.0, n in 2usize..40) {
                let obs: Vec<Observation> = (0..n)
                    .map(|i| Observation::new(i as i64 * 1_000, slope * i as f64))
                    .collect();
                let rate = aggregate_series(&obs, Duration::from_secs(3600), MetricKind::Counter)
                    .value()
                    .unwrap();
                prop_assert!((rate - slope).abs() < 1e-6 * slope.max(1.0));
            }
        }
    }
}
