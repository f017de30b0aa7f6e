//! Prometheus self-telemetry for the autoscaler.
//!
//! # Example
//!
//! ```rust
//! use claw_autoscaler::telemetry::AutoscalerMetrics;
//!
//! let metrics = AutoscalerMetrics::new();
//! metrics.record_tick("web", "published");
//! metrics.set_replicas("web", 2, 4);
//!
//! let output = metrics.encode();
//! assert!(output.contains("clawscaler_ticks_total"));
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Label set for per-workload metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkloadLabels {
    /// The workload identifier.
    pub workload: String,
}

/// Label set for tick outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TickLabels {
    /// The workload identifier.
    pub workload: String,
    /// The tick outcome (e.g. "published", "stable", "unavailable").
    pub outcome: String,
}

/// Autoscaler metrics registered in their own registry.
#[derive(Clone)]
pub struct AutoscalerMetrics {
    registry: Arc<RwLock<Registry>>,
    ticks_total: Family<TickLabels, Counter>,
    ticks_skipped_total: Family<WorkloadLabels, Counter>,
    current_replicas: Family<WorkloadLabels, Gauge>,
    desired_replicas: Family<WorkloadLabels, Gauge>,
    decisions_published_total: Family<WorkloadLabels, Counter>,
    conflicts_total: Family<WorkloadLabels, Counter>,
    tick_duration_seconds: Histogram,
}

impl std::fmt::Debug for AutoscalerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoscalerMetrics").finish_non_exhaustive()
    }
}

impl Default for AutoscalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn labels(workload: &str) -> WorkloadLabels {
    WorkloadLabels {
        workload: workload.to_string(),
    }
}

impl AutoscalerMetrics {
    /// Creates the metrics and registers them.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let ticks_total = Family::<TickLabels, Counter>::default();
        registry.register(
            "clawscaler_ticks",
            "Reconciliation ticks by workload and outcome",
            ticks_total.clone(),
        );

        let ticks_skipped_total = Family::<WorkloadLabels, Counter>::default();
        registry.register(
            "clawscaler_ticks_skipped",
            "Ticks skipped because the workload was still busy",
            ticks_skipped_total.clone(),
        );

        let current_replicas = Family::<WorkloadLabels, Gauge>::default();
        registry.register(
            "clawscaler_current_replicas",
            "Replica count observed at the start of the last tick",
            current_replicas.clone(),
        );

        let desired_replicas = Family::<WorkloadLabels, Gauge>::default();
        registry.register(
            "clawscaler_desired_replicas",
            "Stabilized replica count of the last decision",
            desired_replicas.clone(),
        );

        let decisions_published_total = Family::<WorkloadLabels, Counter>::default();
        registry.register(
            "clawscaler_decisions_published",
            "Replica changes written to the control plane",
            decisions_published_total.clone(),
        );

        let conflicts_total = Family::<WorkloadLabels, Counter>::default();
        registry.register(
            "clawscaler_conflicts",
            "Replica counts changed outside the autoscaler",
            conflicts_total.clone(),
        );

        // 1ms to ~16s
        let tick_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        registry.register(
            "clawscaler_tick_duration_seconds",
            "Time taken by one reconciliation tick",
            tick_duration_seconds.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            ticks_total,
            ticks_skipped_total,
            current_replicas,
            desired_replicas,
            decisions_published_total,
            conflicts_total,
            tick_duration_seconds,
        }
    }

    /// Counts a finished tick.
    pub fn record_tick(&self, workload: &str, outcome: &str) {
        self.ticks_total
            .get_or_create(&TickLabels {
                workload: workload.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Number of ticks recorded for a workload and outcome.
    #[must_use]
    pub fn tick_count(&self, workload: &str, outcome: &str) -> u64 {
        self.ticks_total
            .get_or_create(&TickLabels {
                workload: workload.to_string(),
                outcome: outcome.to_string(),
            })
            .get()
    }

    /// Counts a skipped tick.
    pub fn record_skipped(&self, workload: &str) {
        self.ticks_skipped_total.get_or_create(&labels(workload)).inc();
    }

    /// Number of skipped ticks for a workload.
    #[must_use]
    pub fn skipped_count(&self, workload: &str) -> u64 {
        self.ticks_skipped_total.get_or_create(&labels(workload)).get()
    }

    /// Sets the current and desired replica gauges.
    pub fn set_replicas(&self, workload: &str, current: u32, desired: u32) {
        self.current_replicas
            .get_or_create(&labels(workload))
            .set(i64::from(current));
        self.desired_replicas
            .get_or_create(&labels(workload))
            .set(i64::from(desired));
    }

    /// Counts a published change.
    pub fn record_published(&self, workload: &str) {
        self.decisions_published_total
            .get_or_create(&labels(workload))
            .inc();
    }

    /// Counts a conflict.
    pub fn record_conflict(&self, workload: &str) {
        self.conflicts_total.get_or_create(&labels(workload)).inc();
    }

    /// Number of conflicts recorded for a workload.
    #[must_use]
    pub fn conflict_count(&self, workload: &str) -> u64 {
        self.conflicts_total.get_or_create(&labels(workload)).get()
    }

    /// Records how long a tick took.
    pub fn observe_tick_duration(&self, duration: Duration) {
        self.tick_duration_seconds.observe(duration.as_secs_f64());
    }

    /// Removes the per-workload series of a workload that is no longer managed.
    pub fn forget_workload(&self, workload: &str) {
        let l = labels(workload);
        self.current_replicas.remove(&l);
        self.desired_replicas.remove(&l);
    }

    /// Encodes all metrics in Prometheus text format.
    #[must_use]
    pub fn encode(&self) -> String {
        let registry = self.registry.read();
        let mut buffer = String::new();
        if encode(&mut buffer, &registry).is_err() {
            tracing::error!("failed to encode prometheus metrics");
            return String::new();
        }
        buffer
    }

    /// Returns the Content-Type header value for Prometheus metrics.
    #[must_use]
    pub const fn content_type() -> &'static str {
        "text/plain; version=0.0.4; charset=utf-8"
    }
}
