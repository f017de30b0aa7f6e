//! Policy evaluation: metric values to a desired replica count.
//!
//! Each target proposes `ceil(replicas * value / target)`; the policy takes
//! the largest proposal so no single metric is left under-provisioned.

use claw_metrics::Aggregate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::ScalingPolicy;

/// Guards `ceil` against float noise such as `2.0000000000000004`.
const CEIL_EPSILON: f64 = 1e-9;

/// The aggregated value of one metric target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Target name.
    pub name: String,
    /// Aggregated value.
    pub value: Aggregate,
}

impl MetricValue {
    /// Creates a metric value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Aggregate) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One target's contribution to an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEvaluation {
    /// Target name.
    pub name: String,
    /// Observed value.
    pub value: f64,
    /// Target value.
    pub target: f64,
    /// Replica count this target alone asks for, before clamping.
    pub proposed_replicas: u32,
}

/// Result of evaluating a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Evaluation {
    /// Keep the current replica count; nothing is decided this tick.
    NoChange {
        /// Why nothing was decided.
        reason: String,
    },
    /// A desired replica count.
    Desired {
        /// Desired replicas, clamped to the policy bounds.
        replicas: u32,
        /// Largest proposal before clamping.
        unclamped: u32,
        /// Per-target contributions, in policy order.
        contributions: Vec<TargetEvaluation>,
    },
}

/// Evaluates `policy` against `values` at `current_replicas`.
///
/// Values are matched to targets by name. A target without a value, or with
/// `InsufficientData`, does not contribute.
#[must_use]
pub fn evaluate(policy: &ScalingPolicy, values: &[MetricValue], current_replicas: u32) -> Evaluation {
    if !policy.enabled {
        return Evaluation::NoChange {
            reason: "policy is disabled".into(),
        };
    }

    let base = f64::from(current_replicas.max(1));
    let mut contributions = Vec::with_capacity(policy.targets.len());

    for target in &policy.targets {
        let Some(value) = values
            .iter()
            .find(|v| v.name == target.name)
            .and_then(|v| v.value.value())
        else {
            debug!(
                workload = %policy.workload,
                metric = %target.name,
                "insufficient data for target"
            );
            continue;
        };

        let ratio = value / target.target_value;
        let proposed_replicas = if (ratio - 1.0).abs() <= policy.tolerance {
            current_replicas
        } else {
            replicas_for(base * ratio)
        };

        contributions.push(TargetEvaluation {
            name: target.name.clone(),
            value,
            target: target.target_value,
            proposed_replicas,
        });
    }

    let Some(unclamped) = contributions.iter().map(|c| c.proposed_replicas).max() else {
        return Evaluation::NoChange {
            reason: "insufficient data for all metric targets".into(),
        };
    };

    Evaluation::Desired {
        replicas: policy.clamp(unclamped),
        unclamped,
        contributions,
    }
}

fn replicas_for(raw: f64) -> u32 {
    let ceiled = (raw - CEIL_EPSILON).ceil();
    if ceiled <= 0.0 {
        0
    } else if ceiled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        ceiled as u32
    }
}
