//! Policy document loading.
//!
//! Policies are read from a static, versioned JSON document. A document that
//! cannot be parsed is an error; a single malformed policy only rejects its
//! own workload.
//!
//! ```json
//! {
//!   "version": 1,
//!   "policies": [{
//!     "workload": "go-otel-sample-app",
//!     "min_replicas": 2,
//!     "max_replicas": 4,
//!     "metrics": [{
//!       "name": "go_app_requests_rate",
//!       "selector": "http_requests_total{app=\"go-otel-sample-app\"}",
//!       "kind": "counter",
//!       "target": 10,
//!       "window_secs": 60,
//!       "scale_factor": 60
//!     }]
//!   }]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use claw_metrics::{ComparisonMode, MetricKind, Selector, DEFAULT_INSTANCE_LABEL};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AutoscalerError, Result};
use crate::types::{
    MetricTarget, RateLimit, ScalingPolicy, ScalingRules, DEFAULT_NAMESPACE_LABEL,
};

/// Supported document version.
pub const POLICY_DOCUMENT_VERSION: u32 = 1;

/// Top-level document. Policies stay raw so each can fail on its own.
#[derive(Debug, Deserialize)]
struct RawDocument {
    version: u32,
    #[serde(default)]
    policies: Vec<serde_json::Value>,
}

/// One workload's policy as written in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySpec {
    /// Workload identifier.
    pub workload: String,
    /// Minimum replicas.
    pub min_replicas: u32,
    /// Maximum replicas.
    pub max_replicas: u32,
    /// Relative tolerance around targets.
    #[serde(default)]
    pub tolerance: f64,
    /// Whether the policy is active.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Metric targets.
    pub metrics: Vec<MetricSpec>,
    /// Scaling behaviour.
    #[serde(default)]
    pub behavior: BehaviorSpec,
}

const fn default_true() -> bool {
    true
}

/// One metric target as written in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricSpec {
    /// Target name.
    pub name: String,
    /// Series selector.
    pub selector: String,
    /// Counter or gauge.
    #[serde(default)]
    pub kind: MetricKind,
    /// Target value.
    pub target: f64,
    /// Comparison mode.
    #[serde(default)]
    pub mode: ComparisonMode,
    /// Aggregation window in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Multiplier applied after aggregation.
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    /// Label identifying an instance.
    #[serde(default = "default_instance_label")]
    pub instance_label: String,
    /// Label scoping series to a namespace.
    #[serde(default = "default_namespace_label")]
    pub namespace_label: String,
    /// Namespace the workload runs in.
    #[serde(default)]
    pub namespace: Option<String>,
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_scale_factor() -> f64 {
    1.0
}

fn default_instance_label() -> String {
    DEFAULT_INSTANCE_LABEL.to_string()
}

fn default_namespace_label() -> String {
    DEFAULT_NAMESPACE_LABEL.to_string()
}

/// Scale-up and scale-down behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BehaviorSpec {
    /// Scale-up rules; defaults apply when absent.
    #[serde(default)]
    pub scale_up: Option<DirectionSpec>,
    /// Scale-down rules; defaults apply when absent.
    #[serde(default)]
    pub scale_down: Option<DirectionSpec>,
}

/// Rules for one direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectionSpec {
    /// Stabilization window in seconds.
    pub stabilization_window_secs: u64,
    /// Rate-limit policies; the largest allowed change wins.
    #[serde(default)]
    pub policies: Vec<RatePolicySpec>,
}

/// Kind of a rate-limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatePolicyType {
    /// Percentage of current replicas.
    Percent,
    /// Absolute number of replicas.
    Pods,
}

/// A rate-limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatePolicySpec {
    /// Percent or pods.
    #[serde(rename = "type")]
    pub policy_type: RatePolicyType,
    /// Allowed change.
    pub value: u32,
    /// Period in seconds.
    pub period_secs: u64,
}

impl DirectionSpec {
    fn to_rules(&self, direction: &str) -> Result<ScalingRules> {
        let mut rate_limit = RateLimit::unlimited();
        for p in &self.policies {
            if p.period_secs == 0 {
                return Err(AutoscalerError::InvalidPolicy {
                    reason: format!("{direction} policy period_secs must be non-zero"),
                });
            }
            match p.policy_type {
                RatePolicyType::Percent => {
                    rate_limit.percent = Some(rate_limit.percent.unwrap_or(0).max(p.value));
                }
                RatePolicyType::Pods => {
                    rate_limit.absolute = Some(rate_limit.absolute.unwrap_or(0).max(p.value));
                }
            }
            rate_limit.period = rate_limit.period.max(Duration::from_secs(p.period_secs));
        }
        Ok(ScalingRules::new(
            Duration::from_secs(self.stabilization_window_secs),
            rate_limit,
        ))
    }
}

impl MetricSpec {
    fn to_target(&self) -> Result<MetricTarget> {
        let selector = Selector::parse(&self.selector).map_err(|e| AutoscalerError::InvalidPolicy {
            reason: format!("metric '{}': {e}", self.name),
        })?;
        let mut target = MetricTarget::new(self.name.clone(), selector, self.target)
            .with_kind(self.kind)
            .with_mode(self.mode)
            .with_window(Duration::from_secs(self.window_secs))
            .with_scale_factor(self.scale_factor)
            .with_instance_label(self.instance_label.clone());
        target.namespace_label.clone_from(&self.namespace_label);
        target.namespace.clone_from(&self.namespace);
        Ok(target)
    }
}

impl PolicySpec {
    /// Converts to a validated [`ScalingPolicy`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if any field is invalid.
    pub fn to_policy(&self) -> Result<ScalingPolicy> {
        let mut builder = ScalingPolicy::builder(self.workload.clone())
            .min_replicas(self.min_replicas)
            .max_replicas(self.max_replicas)
            .tolerance(self.tolerance)
            .enabled(self.enabled);

        for metric in &self.metrics {
            builder = builder.target(metric.to_target()?);
        }
        if let Some(up) = &self.behavior.scale_up {
            builder = builder.scale_up(up.to_rules("scale_up")?);
        }
        if let Some(down) = &self.behavior.scale_down {
            builder = builder.scale_down(down.to_rules("scale_down")?);
        }

        builder.build()
    }
}

/// A policy that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPolicy {
    /// Workload name, or the policy's position when the name is unreadable.
    pub workload: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Result of loading a policy document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadReport {
    /// Document version.
    pub version: u32,
    /// Valid policies, in document order.
    pub policies: Vec<ScalingPolicy>,
    /// Rejected policies.
    pub rejected: Vec<RejectedPolicy>,
}

impl LoadReport {
    /// Returns true if any policy was rejected.
    #[must_use]
    pub fn has_rejections(&self) -> bool {
        !self.rejected.is_empty()
    }
}

/// Parses a policy document.
///
/// # Errors
///
/// Returns `InvalidDocument` if the document is not valid JSON, lacks a
/// version, or has an unsupported version.
pub fn parse_policies(json: &str) -> Result<LoadReport> {
    let raw: RawDocument = serde_json::from_str(json).map_err(|e| AutoscalerError::InvalidDocument {
        reason: e.to_string(),
    })?;

    if raw.version != POLICY_DOCUMENT_VERSION {
        return Err(AutoscalerError::InvalidDocument {
            reason: format!(
                "unsupported version {} (expected {POLICY_DOCUMENT_VERSION})",
                raw.version
            ),
        });
    }

    let mut report = LoadReport {
        version: raw.version,
        ..LoadReport::default()
    };
    let mut seen = HashSet::new();

    for (index, value) in raw.policies.into_iter().enumerate() {
        let name = value
            .get("workload")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| format!("policies[{index}]"), str::to_string);

        let result = serde_json::from_value::<PolicySpec>(value)
            .map_err(|e| AutoscalerError::InvalidPolicy {
                reason: e.to_string(),
            })
            .and_then(|spec| spec.to_policy());

        match result {
            Ok(policy) if !seen.insert(policy.workload.clone()) => {
                warn!(workload = %name, "duplicate policy rejected");
                report.rejected.push(RejectedPolicy {
                    workload: name,
                    reason: "duplicate workload".into(),
                });
            }
            Ok(policy) => report.policies.push(policy),
            Err(e) => {
                warn!(workload = %name, error = %e, "policy rejected");
                report.rejected.push(RejectedPolicy {
                    workload: name,
                    reason: e.to_string(),
                });
            }
        }
    }

    info!(
        version = report.version,
        loaded = report.policies.len(),
        rejected = report.rejected.len(),
        "parsed policy document"
    );
    Ok(report)
}

/// Loads a policy document from a file.
///
/// # Errors
///
/// Returns `InvalidDocument` if the file cannot be read or parsed.
pub fn load_policies(path: impl AsRef<Path>) -> Result<LoadReport> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| AutoscalerError::InvalidDocument {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_policies(&content)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const GOOD: &str = r#"{
        "version": 1,
        "policies": [
            {
                "workload": "go-otel-sample-app",
                "min_replicas": 2,
                "max_replicas": 4,
                "metrics": [{
                    "name": "go_app_requests_rate",
                    "selector": "http_requests_total{app=\"go-otel-sample-app\"}",
                    "kind": "counter",
                    "target": 10,
                    "window_secs": 60,
                    "scale_factor": 60,
                    "namespace": "default"
                }],
                "behavior": {
                    "scale_up": {
                        "stabilization_window_secs": 60,
                        "policies": [{"type": "percent", "value": 100, "period_secs": 15}]
                    },
                    "scale_down": {
                        "stabilization_window_secs": 300,
                        "policies": [
                            {"type": "percent", "value": 10, "period_secs": 60},
                            {"type": "pods", "value": 1, "period_secs": 60}
                        ]
                    }
                }
            },
            {
                "workload": "otel-sample-app",
                "min_replicas": 2,
                "max_replicas": 3,
                "metrics": [{
                    "name": "pod_cpu_utilization",
                    "selector": "pod_cpu_utilization{app=\"otel-sample-app\"}",
                    "target": 50,
                    "mode": "utilization"
                }]
            }
        ]
    }"#;

    mod parse_tests {
        use super::*;

        #[test]
        fn parses_full_document() {
            let report = parse_policies(GOOD).unwrap();
            assert_eq!(report.version, 1);
            assert_eq!(report.policies.len(), 2);
            assert!(!report.has_rejections());

            let go = &report.policies[0];
            assert_eq!(go.workload.as_str(), "go-otel-sample-app");
            assert_eq!(go.targets[0].kind, MetricKind::Counter);
            assert!((go.targets[0].scale_factor - 60.0).abs() < f64::EPSILON);
            assert_eq!(
                go.targets[0].target_labels().get("kubernetes_namespace"),
                Some("default")
            );
            assert_eq!(go.scale_down.rate_limit.percent, Some(10));
            assert_eq!(go.scale_down.rate_limit.absolute, Some(1));
            assert_eq!(go.scale_down.rate_limit.period, Duration::from_secs(60));

            let otel = &report.policies[1];
            assert_eq!(otel.targets[0].mode, ComparisonMode::Utilization);
            assert_eq!(otel.targets[0].kind, MetricKind::Gauge);
            assert_eq!(otel.scale_down, ScalingRules::default_scale_down());
        }

        #[test]
        fn malformed_policy_rejects_only_that_workload() {
            let doc = r#"{
                "version": 1,
                "policies": [
                    {"workload": "bad-bounds", "min_replicas": 5, "max_replicas": 2,
                     "metrics": [{"name": "m", "selector": "m", "target": 1}]},
                    {"workload": "bad-selector", "min_replicas": 1, "max_replicas": 2,
                     "metrics": [{"name": "m", "selector": "rate(m[1m])", "target": 1}]},
                    {"min_replicas": 1},
                    {"workload": "good", "min_replicas": 1, "max_replicas": 2,
                     "metrics": [{"name": "m", "selector": "m", "target": 1}]},
                    {"workload": "good", "min_replicas": 1, "max_replicas": 3,
                     "metrics": [{"name": "m", "selector": "m", "target": 1}]}
                ]
            }"#;
            let report = parse_policies(doc).unwrap();
            assert_eq!(report.policies.len(), 1);
            assert_eq!(report.policies[0].max_replicas, 2);

            let rejected: Vec<&str> = report.rejected.iter().map(|r| r.workload.as_str()).collect();
            assert_eq!(rejected, vec!["bad-bounds", "bad-selector", "policies[2]", "good"]);
        }

        #[test]
        fn unknown_fields_reject_policy() {
            let doc = r#"{"version": 1, "policies": [
                {"workload": "w", "min_replicas": 1, "max_replicas": 2, "replicas": 3,
                 "metrics": [{"name": "m", "selector": "m", "target": 1}]}
            ]}"#;
            let report = parse_policies(doc).unwrap();
            assert!(report.policies.is_empty());
            assert_eq!(report.rejected.len(), 1);
        }

        #[test]
        fn zero_rate_period_rejected() {
            let doc = r#"{"version": 1, "policies": [
                {"workload": "w", "min_replicas": 1, "max_replicas": 2,
                 "metrics": [{"name": "m", "selector": "m", "target": 1}],
                 "behavior": {"scale_up": {"stabilization_window_secs": 0,
                    "policies": [{"type": "pods", "value": 4, "period_secs": 0}]}}}
            ]}"#;
            let report = parse_policies(doc).unwrap();
            assert!(report.has_rejections());
        }

        #[test_case::test_case(
            r#""behavior": {"scale_down": {"stabilization_window_secs": 10000000000000}}"# ;
            "stabilization window"
        )]
        #[test_case::test_case(
            r#""behavior": {"scale_up": {"stabilization_window_secs": 60,
                "policies": [{"type": "pods", "value": 4, "period_secs": 10000000000000}]}}"# ;
            "rate period"
        )]
        fn oversized_window_rejects_policy(behavior: &str) {
            let doc = format!(
                r#"{{"version": 1, "policies": [
                    {{"workload": "w", "min_replicas": 1, "max_replicas": 5,
                     "metrics": [{{"name": "m", "selector": "m", "target": 1}}],
                     {behavior}}},
                    {{"workload": "ok", "min_replicas": 1, "max_replicas": 2,
                     "metrics": [{{"name": "m", "selector": "m", "target": 1}}]}}
                ]}}"#
            );
            let report = parse_policies(&doc).unwrap();
            assert_eq!(report.rejected.len(), 1);
            assert_eq!(report.rejected[0].workload, "w");
            assert_eq!(report.policies.len(), 1);
            assert_eq!(report.policies[0].workload.as_str(), "ok");
        }

        #[test]
        fn oversized_metric_window_rejects_policy() {
            let doc = r#"{"version": 1, "policies": [
                {"workload": "w", "min_replicas": 1, "max_replicas": 2,
                 "metrics": [{"name": "m", "selector": "m", "target": 1,
                              "window_secs": 10000000000000}]}
            ]}"#;
            let report = parse_policies(doc).unwrap();
            assert!(report.policies.is_empty());
            assert_eq!(report.rejected.len(), 1);
        }
    }

    mod document_tests {
        use super::*;
        use test_case::test_case;

        #[test_case("not json" ; "garbage")]
        #[test_case(r#"{"policies": []}"# ; "missing version")]
        #[test_case(r#"{"version": 2, "policies": []}"# ; "unsupported version")]
        #[test_case(r#"{"version": 1, "policies": {}}"# ; "policies not a list")]
        fn malformed_document_is_error(doc: &str) {
            assert!(matches!(
                parse_policies(doc),
                Err(AutoscalerError::InvalidDocument { .. })
            ));
        }

        #[test]
        fn load_from_file() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(GOOD.as_bytes()).unwrap();
            let report = load_policies(file.path()).unwrap();
            assert_eq!(report.policies.len(), 2);
        }

        #[test]
        fn missing_file_is_error() {
            let dir = tempfile::tempdir().unwrap();
            assert!(load_policies(dir.path().join("missing.json")).is_err());
        }
    }
}
