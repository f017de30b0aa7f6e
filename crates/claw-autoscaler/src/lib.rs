//! Metrics-driven horizontal autoscaling for Clawbernetes workloads.
//!
//! `claw-autoscaler` turns metric samples into replica counts. Each workload
//! gets its own reconciler task that runs the pipeline
//!
//! ```text
//! sample -> aggregate -> evaluate -> stabilize -> publish
//! ```
//!
//! once per tick, and an [`AutoscalerManager`] drives all of them from a
//! single timer.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use chrono::Utc;
//! use claw_autoscaler::{evaluate, Evaluation, MetricTarget, MetricValue, ScalingPolicy};
//! use claw_autoscaler::stabilization::StabilizationState;
//! use claw_metrics::{Aggregate, Selector};
//!
//! let selector = Selector::parse(r#"http_requests_total{app="web"}"#).unwrap();
//! let policy = ScalingPolicy::builder("web")
//!     .min_replicas(2)
//!     .max_replicas(4)
//!     .target(MetricTarget::new("requests", selector, 10.0))
//!     .build()
//!     .unwrap();
//!
//! let values = [MetricValue::new("requests", Aggregate::Value(30.0))];
//! let Evaluation::Desired { replicas, .. } = evaluate(&policy, &values, 2) else {
//!     panic!("expected a desired count");
//! };
//! assert_eq!(replicas, 4);
//!
//! let mut state = StabilizationState::new();
//! let target = state.stabilize(&policy, 2, replicas, Utc::now());
//! assert_eq!(target.replicas, 4);
//! ```
//!
//! # Policies
//!
//! Policies are loaded from a versioned JSON document with
//! [`config::load_policies`]; see the [`config`] module for the format.

#![forbid(unsafe_code)]
#![doc(html_root_url = "https://docs.rs/claw-autoscaler/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod audit;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod manager;
pub mod publisher;
pub mod reconciler;
pub mod stabilization;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use audit::{DecisionLog, PublishedDecision};
pub use config::{load_policies, parse_policies, LoadReport, PolicySpec, RejectedPolicy};
pub use error::{AutoscalerError, Result};
pub use evaluator::{evaluate, Evaluation, MetricValue, TargetEvaluation};
pub use manager::{AutoscalerManager, ManagerCommand, ManagerHandle, ReloadSummary};
pub use publisher::{
    ControlPlane, DecisionPublisher, InMemoryControlPlane, PublishOutcome, ReplicaStatus,
};
pub use reconciler::{
    ConflictPolicy, ConflictReport, ReconcilerConfig, TickOutcome, WorkloadControl,
    WorkloadPhase, WorkloadReconciler, WorkloadStatus,
};
pub use stabilization::{StabilizationPhase, StabilizationState, StabilizedTarget};
pub use telemetry::AutoscalerMetrics;
pub use types::{
    MetricTarget, RateLimit, ScaleDirection, ScalingDecision, ScalingPolicy,
    ScalingPolicyBuilder, ScalingRules, WorkloadId,
};
