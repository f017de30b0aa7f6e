//! Core types for the autoscaler system.
//!
//! This module provides the fundamental types used throughout claw-autoscaler:
//! - [`WorkloadId`]: Identifier of a scaled workload
//! - [`MetricTarget`]: One metric and the per-replica value it should hold
//! - [`ScalingPolicy`]: Targets, replica bounds and scaling behaviour
//! - [`ScalingDecision`]: The outcome of one reconciliation tick

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_metrics::{
    AggregationSpec, ComparisonMode, LabelSet, MetricKind, SeriesQuery, Selector,
    DEFAULT_INSTANCE_LABEL,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AutoscalerError, Result};

/// Default label scoping series to a namespace.
pub const DEFAULT_NAMESPACE_LABEL: &str = "kubernetes_namespace";

/// Longest accepted aggregation window, stabilization window or rate-limit period.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Unique identifier for a scaled workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(String);

impl WorkloadId {
    /// Creates a new workload ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A metric and the value it should hold per replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTarget {
    /// Name used in decisions and logs (e.g. `go_app_requests_rate`).
    pub name: String,
    /// Series selector.
    pub selector: Selector,
    /// Counter or gauge semantics of the selected series.
    pub kind: MetricKind,
    /// Target value per replica (or target ratio for utilization).
    pub target_value: f64,
    /// How the aggregate is compared against the target.
    pub mode: ComparisonMode,
    /// Aggregation window.
    pub window: Duration,
    /// Multiplier applied after aggregation.
    pub scale_factor: f64,
    /// Label identifying the instance of a series.
    pub instance_label: String,
    /// Label scoping series to a namespace.
    pub namespace_label: String,
    /// Namespace the workload runs in, if series should be scoped to it.
    pub namespace: Option<String>,
}

impl MetricTarget {
    /// Creates an average-value gauge target with a 60s window.
    #[must_use]
    pub fn new(name: impl Into<String>, selector: Selector, target_value: f64) -> Self {
        Self {
            name: name.into(),
            selector,
            kind: MetricKind::Gauge,
            target_value,
            mode: ComparisonMode::AverageValue,
            window: Duration::from_secs(60),
            scale_factor: 1.0,
            instance_label: DEFAULT_INSTANCE_LABEL.to_string(),
            namespace_label: DEFAULT_NAMESPACE_LABEL.to_string(),
            namespace: None,
        }
    }

    /// Sets counter or gauge semantics.
    #[must_use]
    pub const fn with_kind(mut self, kind: MetricKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the comparison mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: ComparisonMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the aggregation window.
    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Sets the scale factor.
    #[must_use]
    pub const fn with_scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    /// Sets the instance label.
    #[must_use]
    pub fn with_instance_label(mut self, label: impl Into<String>) -> Self {
        self.instance_label = label.into();
        self
    }

    /// Scopes series to a namespace through `namespace_label`.
    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Labels every sampled series must carry.
    #[must_use]
    pub fn target_labels(&self) -> LabelSet {
        let mut labels = LabelSet::new();
        if let Some(ns) = &self.namespace {
            labels.insert(&self.namespace_label, ns);
        }
        labels
    }

    /// The sampler query for this target.
    #[must_use]
    pub fn series_query(&self) -> SeriesQuery {
        SeriesQuery::new(self.selector.clone(), self.window)
            .with_instance_label(self.instance_label.clone())
    }

    /// The aggregation parameters for this target.
    #[must_use]
    pub const fn aggregation_spec(&self) -> AggregationSpec {
        AggregationSpec::new(self.window, self.kind, self.mode).with_scale_factor(self.scale_factor)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AutoscalerError::InvalidPolicy {
                reason: "metric target name cannot be empty".into(),
            });
        }
        if !self.target_value.is_finite() || self.target_value <= 0.0 {
            return Err(AutoscalerError::InvalidPolicy {
                reason: format!("target value for '{}' must be positive", self.name),
            });
        }
        if !self.scale_factor.is_finite() || self.scale_factor <= 0.0 {
            return Err(AutoscalerError::InvalidPolicy {
                reason: format!("scale factor for '{}' must be positive", self.name),
            });
        }
        if self.window.is_zero() {
            return Err(AutoscalerError::InvalidPolicy {
                reason: format!("window for '{}' must be non-zero", self.name),
            });
        }
        if self.window > MAX_WINDOW {
            return Err(AutoscalerError::InvalidPolicy {
                reason: format!(
                    "window for '{}' exceeds {}s",
                    self.name,
                    MAX_WINDOW.as_secs()
                ),
            });
        }
        Ok(())
    }
}

/// Limits how far replicas may move within a period.
///
/// With both limits set the larger allowed delta wins. With neither set the
/// direction is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Allowed change as a percentage of the replica count at period start.
    pub percent: Option<u32>,
    /// Allowed change in replicas.
    pub absolute: Option<u32>,
    /// Length of the rate-limit period.
    pub period: Duration,
}

impl RateLimit {
    /// No limit.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            percent: None,
            absolute: None,
            period: Duration::ZERO,
        }
    }

    /// A percentage limit per period.
    #[must_use]
    pub const fn percent(percent: u32, period: Duration) -> Self {
        Self {
            percent: Some(percent),
            absolute: None,
            period,
        }
    }

    /// An absolute limit per period.
    #[must_use]
    pub const fn absolute(replicas: u32, period: Duration) -> Self {
        Self {
            percent: None,
            absolute: Some(replicas),
            period,
        }
    }

    /// Adds an absolute limit alongside the percentage one.
    #[must_use]
    pub const fn with_absolute(mut self, replicas: u32) -> Self {
        self.absolute = Some(replicas);
        self
    }

    /// Returns true if neither limit is set.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.percent.is_none() && self.absolute.is_none()
    }

    /// Maximum change allowed from `base` replicas, or `None` when unlimited.
    ///
    /// A non-zero percentage always allows at least one replica.
    #[must_use]
    pub fn allowed(&self, base: u32) -> Option<u32> {
        if self.is_unlimited() {
            return None;
        }
        let by_percent = self.percent.map_or(0, |pct| {
            if pct == 0 {
                0
            } else {
                let raw = (u64::from(base.max(1)) * u64::from(pct)).div_ceil(100);
                u32::try_from(raw).unwrap_or(u32::MAX).max(1)
            }
        });
        Some(by_percent.max(self.absolute.unwrap_or(0)))
    }
}

/// Stabilization and rate limiting for one scaling direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingRules {
    /// Minimum time between two moves in this direction, and the lookback
    /// for scale-down recommendations.
    pub stabilization_window: Duration,
    /// Rate limit for this direction.
    pub rate_limit: RateLimit,
}

impl ScalingRules {
    /// Creates rules.
    #[must_use]
    pub const fn new(stabilization_window: Duration, rate_limit: RateLimit) -> Self {
        Self {
            stabilization_window,
            rate_limit,
        }
    }

    /// Scale-up defaults: 60s window, 100% per 15s.
    #[must_use]
    pub const fn default_scale_up() -> Self {
        Self::new(
            Duration::from_secs(60),
            RateLimit::percent(100, Duration::from_secs(15)),
        )
    }

    /// Scale-down defaults: 300s window, 10% per 60s.
    #[must_use]
    pub const fn default_scale_down() -> Self {
        Self::new(
            Duration::from_secs(300),
            RateLimit::percent(10, Duration::from_secs(60)),
        )
    }
}

/// Complete scaling policy for one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    /// Workload this policy scales.
    pub workload: WorkloadId,
    /// Metric targets, in evaluation order.
    pub targets: Vec<MetricTarget>,
    /// Minimum number of replicas (never scale below this).
    pub min_replicas: u32,
    /// Maximum number of replicas (never scale above this).
    pub max_replicas: u32,
    /// Relative deviation from a target that is ignored (0.1 = ±10%).
    pub tolerance: f64,
    /// Scale-up behaviour.
    pub scale_up: ScalingRules,
    /// Scale-down behaviour.
    pub scale_down: ScalingRules,
    /// Whether this policy is enabled.
    pub enabled: bool,
}

impl ScalingPolicy {
    /// Creates a new scaling policy builder.
    #[must_use]
    pub fn builder(workload: impl Into<String>) -> ScalingPolicyBuilder {
        ScalingPolicyBuilder::new(workload)
    }

    /// Validates this policy configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the policy is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.workload.as_str().trim().is_empty() {
            return Err(AutoscalerError::InvalidPolicy {
                reason: "workload cannot be empty".into(),
            });
        }

        if self.min_replicas > self.max_replicas {
            return Err(AutoscalerError::InvalidPolicy {
                reason: format!(
                    "min_replicas ({}) cannot exceed max_replicas ({})",
                    self.min_replicas, self.max_replicas
                ),
            });
        }

        if self.max_replicas == 0 {
            return Err(AutoscalerError::InvalidPolicy {
                reason: "max_replicas must be at least 1".into(),
            });
        }

        if self.targets.is_empty() {
            return Err(AutoscalerError::InvalidPolicy {
                reason: "policy must have at least one metric target".into(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !seen.insert(target.name.as_str()) {
                return Err(AutoscalerError::InvalidPolicy {
                    reason: format!("duplicate metric target '{}'", target.name),
                });
            }
        }

        if !self.tolerance.is_finite() || !(0.0..1.0).contains(&self.tolerance) {
            return Err(AutoscalerError::InvalidPolicy {
                reason: "tolerance must be in [0, 1)".into(),
            });
        }

        for (direction, rules) in [("scale_up", &self.scale_up), ("scale_down", &self.scale_down)] {
            if !rules.rate_limit.is_unlimited() && rules.rate_limit.period.is_zero() {
                return Err(AutoscalerError::InvalidPolicy {
                    reason: format!("{direction} rate limit period must be non-zero"),
                });
            }
            if rules.stabilization_window > MAX_WINDOW || rules.rate_limit.period > MAX_WINDOW {
                return Err(AutoscalerError::InvalidPolicy {
                    reason: format!(
                        "{direction} window and period cannot exceed {}s",
                        MAX_WINDOW.as_secs()
                    ),
                });
            }
        }

        Ok(())
    }

    /// Clamps a replica count into `[min_replicas, max_replicas]`.
    #[must_use]
    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.min_replicas, self.max_replicas)
    }

    /// Longest window or period the stabilization history must cover.
    #[must_use]
    pub fn longest_window(&self) -> Duration {
        [
            self.scale_up.stabilization_window,
            self.scale_down.stabilization_window,
            self.scale_up.rate_limit.period,
            self.scale_down.rate_limit.period,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }
}

/// Builder for creating scaling policies.
#[derive(Debug)]
pub struct ScalingPolicyBuilder {
    workload: String,
    targets: Vec<MetricTarget>,
    min_replicas: u32,
    max_replicas: u32,
    tolerance: f64,
    scale_up: ScalingRules,
    scale_down: ScalingRules,
    enabled: bool,
}

impl ScalingPolicyBuilder {
    /// Creates a new builder with required fields.
    #[must_use]
    pub fn new(workload: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            targets: Vec::new(),
            min_replicas: 1,
            max_replicas: 10,
            tolerance: 0.0,
            scale_up: ScalingRules::default_scale_up(),
            scale_down: ScalingRules::default_scale_down(),
            enabled: true,
        }
    }

    /// Sets the minimum number of replicas.
    #[must_use]
    pub const fn min_replicas(mut self, min: u32) -> Self {
        self.min_replicas = min;
        self
    }

    /// Sets the maximum number of replicas.
    #[must_use]
    pub const fn max_replicas(mut self, max: u32) -> Self {
        self.max_replicas = max;
        self
    }

    /// Appends a metric target.
    #[must_use]
    pub fn target(mut self, target: MetricTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// Sets the tolerance.
    #[must_use]
    pub const fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets the scale-up rules.
    #[must_use]
    pub const fn scale_up(mut self, rules: ScalingRules) -> Self {
        self.scale_up = rules;
        self
    }

    /// Sets the scale-down rules.
    #[must_use]
    pub const fn scale_down(mut self, rules: ScalingRules) -> Self {
        self.scale_down = rules;
        self
    }

    /// Sets whether the policy is enabled.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builds the scaling policy.
    ///
    /// # Errors
    ///
    /// Returns error if the policy is invalid.
    pub fn build(self) -> Result<ScalingPolicy> {
        let policy = ScalingPolicy {
            workload: WorkloadId::new(self.workload),
            targets: self.targets,
            min_replicas: self.min_replicas,
            max_replicas: self.max_replicas,
            tolerance: self.tolerance,
            scale_up: self.scale_up,
            scale_down: self.scale_down,
            enabled: self.enabled,
        };

        policy.validate()?;
        Ok(policy)
    }
}

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    /// Increase the number of replicas.
    Up,
    /// Decrease the number of replicas.
    Down,
    /// Maintain current replica count.
    None,
}

impl ScaleDirection {
    /// Direction of a move from `current` to `target`.
    #[must_use]
    pub const fn between(current: u32, target: u32) -> Self {
        if target > current {
            Self::Up
        } else if target < current {
            Self::Down
        } else {
            Self::None
        }
    }
}

/// The outcome of one reconciliation tick for a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    /// Unique decision identifier.
    pub id: Uuid,
    /// Workload this decision applies to.
    pub workload: WorkloadId,
    /// Replica count when the tick started.
    pub current_replicas: u32,
    /// Stabilized replica count.
    pub desired_replicas: u32,
    /// Direction of the decision.
    pub direction: ScaleDirection,
    /// Human-readable reason for this decision.
    pub reason: String,
    /// When this decision was made.
    pub timestamp: DateTime<Utc>,
    /// Metric values that contributed, by target name.
    pub metrics: BTreeMap<String, f64>,
}

impl ScalingDecision {
    /// Creates a new decision.
    #[must_use]
    pub fn new(
        workload: WorkloadId,
        current_replicas: u32,
        desired_replicas: u32,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workload,
            current_replicas,
            desired_replicas,
            direction: ScaleDirection::between(current_replicas, desired_replicas),
            reason: reason.into(),
            timestamp,
            metrics: BTreeMap::new(),
        }
    }

    /// Adds a metric that influenced this decision.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Returns true if the decision changes the replica count.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.direction != ScaleDirection::None
    }

    /// Returns the delta (change in replica count).
    #[must_use]
    pub fn delta(&self) -> i64 {
        i64::from(self.desired_replicas) - i64::from(self.current_replicas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn rps_target(target: f64) -> MetricTarget {
        MetricTarget::new(
            "go_app_requests_rate",
            Selector::parse(r#"http_requests_total{app="go-otel-sample-app"}"#).unwrap(),
            target,
        )
        .with_kind(MetricKind::Counter)
        .with_scale_factor(60.0)
    }

    mod workload_id_tests {
        use super::*;

        #[test]
        fn workload_id_creation_and_display() {
            let id = WorkloadId::new("java-otel-sample-app");
            assert_eq!(id.as_str(), "java-otel-sample-app");
            assert_eq!(format!("{id}"), "java-otel-sample-app");
        }

        #[test]
        fn workload_id_serializes_as_string() {
            let id = WorkloadId::new("web");
            assert_eq!(serde_json::to_string(&id).unwrap(), "\"web\"");
        }
    }

    mod rate_limit_tests {
        use super::*;
        use test_case::test_case;

        #[test_case(RateLimit::percent(100, Duration::from_secs(15)), 2, Some(2) ; "double")]
        #[test_case(RateLimit::percent(10, Duration::from_secs(60)), 4, Some(1) ; "ten percent rounds up to one")]
        #[test_case(RateLimit::percent(10, Duration::from_secs(60)), 25, Some(3) ; "ten percent of 25")]
        #[test_case(RateLimit::absolute(4, Duration::from_secs(15)), 2, Some(4) ; "absolute")]
        #[test_case(RateLimit::percent(100, Duration::from_secs(15)).with_absolute(4), 2, Some(4) ; "larger wins absolute")]
        #[test_case(RateLimit::percent(100, Duration::from_secs(15)).with_absolute(4), 10, Some(10) ; "larger wins percent")]
        #[test_case(RateLimit::percent(50, Duration::from_secs(15)), 0, Some(1) ; "zero base")]
        #[test_case(RateLimit::unlimited(), 7, None ; "unlimited")]
        fn allowed_delta(limit: RateLimit, base: u32, expected: Option<u32>) {
            assert_eq!(limit.allowed(base), expected);
        }
    }

    mod target_tests {
        use super::*;

        #[test]
        fn namespace_scopes_target_labels() {
            let target = rps_target(10.0).in_namespace("default");
            assert_eq!(
                target.target_labels().get(DEFAULT_NAMESPACE_LABEL),
                Some("default")
            );
            assert!(rps_target(10.0).target_labels().is_empty());
        }

        #[test]
        fn query_and_spec_follow_target() {
            let target = rps_target(10.0)
                .with_window(Duration::from_secs(120))
                .with_instance_label("pod");
            let query = target.series_query();
            assert_eq!(query.window, Duration::from_secs(120));
            assert_eq!(query.instance_label, "pod");

            let spec = target.aggregation_spec();
            assert_eq!(spec.kind, MetricKind::Counter);
            assert!((spec.scale_factor - 60.0).abs() < f64::EPSILON);
        }
    }

    mod scaling_policy_tests {
        use super::*;

        #[test]
        fn policy_builder_defaults() {
            let policy = ScalingPolicy::builder("go-otel-sample-app")
                .min_replicas(2)
                .max_replicas(4)
                .target(rps_target(10.0))
                .build()
                .unwrap();

            assert_eq!(policy.scale_up, ScalingRules::default_scale_up());
            assert_eq!(
                policy.scale_down.stabilization_window,
                Duration::from_secs(300)
            );
            assert_eq!(policy.longest_window(), Duration::from_secs(300));
            assert!(policy.enabled);
        }

        #[test]
        fn policy_validation_min_greater_than_max() {
            let result = ScalingPolicy::builder("web")
                .min_replicas(5)
                .max_replicas(2)
                .target(rps_target(10.0))
                .build();
            assert!(matches!(result, Err(AutoscalerError::InvalidPolicy { .. })));
        }

        #[test]
        fn policy_validation_max_zero() {
            let result = ScalingPolicy::builder("web")
                .min_replicas(0)
                .max_replicas(0)
                .target(rps_target(10.0))
                .build();
            assert!(result.is_err());
        }

        #[test]
        fn policy_requires_targets() {
            assert!(ScalingPolicy::builder("web").build().is_err());
        }

        #[test]
        fn policy_rejects_non_positive_target() {
            let result = ScalingPolicy::builder("web").target(rps_target(0.0)).build();
            assert!(result.is_err());
        }

        #[test]
        fn policy_rejects_duplicate_targets() {
            let result = ScalingPolicy::builder("web")
                .target(rps_target(10.0))
                .target(rps_target(20.0))
                .build();
            assert!(result.is_err());
        }

        #[test]
        fn policy_rejects_bad_tolerance() {
            let result = ScalingPolicy::builder("web")
                .target(rps_target(10.0))
                .tolerance(1.5)
                .build();
            assert!(result.is_err());
        }

        #[test]
        fn policy_rejects_zero_rate_period() {
            let result = ScalingPolicy::builder("web")
                .target(rps_target(10.0))
                .scale_up(ScalingRules::new(
                    Duration::from_secs(60),
                    RateLimit::percent(100, Duration::ZERO),
                ))
                .build();
            assert!(result.is_err());
        }

        #[test]
        fn policy_rejects_oversized_windows() {
            let huge = Duration::from_secs(10_000_000_000_000);
            let down_window = ScalingPolicy::builder("web")
                .target(rps_target(10.0))
                .scale_down(ScalingRules::new(huge, RateLimit::percent(10, Duration::from_secs(60))))
                .build();
            assert!(matches!(down_window, Err(AutoscalerError::InvalidPolicy { .. })));

            let up_period = ScalingPolicy::builder("web")
                .target(rps_target(10.0))
                .scale_up(ScalingRules::new(Duration::from_secs(60), RateLimit::percent(100, huge)))
                .build();
            assert!(up_period.is_err());

            let metric_window = ScalingPolicy::builder("web")
                .target(rps_target(10.0).with_window(MAX_WINDOW + Duration::from_secs(1)))
                .build();
            assert!(metric_window.is_err());

            let at_cap = ScalingPolicy::builder("web")
                .target(rps_target(10.0).with_window(MAX_WINDOW))
                .scale_down(ScalingRules::new(MAX_WINDOW, RateLimit::percent(10, MAX_WINDOW)))
                .build();
            assert!(at_cap.is_ok());
        }

        #[test]
        fn clamp_to_bounds() {
            let policy = ScalingPolicy::builder("web")
                .min_replicas(2)
                .max_replicas(8)
                .target(rps_target(10.0))
                .build()
                .unwrap();
            assert_eq!(policy.clamp(15), 8);
            assert_eq!(policy.clamp(0), 2);
            assert_eq!(policy.clamp(5), 5);
        }

        #[test]
        fn policy_serialization_roundtrip() {
            let policy = ScalingPolicy::builder("web")
                .target(rps_target(10.0))
                .build()
                .unwrap();
            let json = serde_json::to_string(&policy).unwrap();
            let parsed: ScalingPolicy = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, policy);
        }
    }

    mod decision_tests {
        use super::*;

        #[test]
        fn decision_direction_and_delta() {
            let now = Utc::now();
            let up = ScalingDecision::new(WorkloadId::new("web"), 2, 4, "load", now)
                .with_metric("go_app_requests_rate", 20.0);
            assert_eq!(up.direction, ScaleDirection::Up);
            assert_eq!(up.delta(), 2);
            assert!(up.is_change());
            assert_eq!(up.metrics.get("go_app_requests_rate"), Some(&20.0));

            let hold = ScalingDecision::new(WorkloadId::new("web"), 3, 3, "stable", now);
            assert_eq!(hold.direction, ScaleDirection::None);
            assert!(!hold.is_change());

            let down = ScalingDecision::new(WorkloadId::new("web"), 4, 3, "idle", now);
            assert_eq!(down.direction, ScaleDirection::Down);
            assert_eq!(down.delta(), -1);
        }

        #[test]
        fn decisions_have_unique_ids() {
            let now = Utc::now();
            let a = ScalingDecision::new(WorkloadId::new("web"), 1, 2, "", now);
            let b = ScalingDecision::new(WorkloadId::new("web"), 1, 2, "", now);
            assert_ne!(a.id, b.id);
        }
    }
}
