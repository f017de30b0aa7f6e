//! Per-workload reconciliation.
//!
//! A [`WorkloadReconciler`] owns everything one workload needs between ticks:
//! its stabilization history, its publisher baseline and its decision log.
//! It runs as its own tokio task; the only things shared with the rest of the
//! process are channels.
//!
//! One tick is:
//!
//! 1. observe current replicas (detecting manual overrides and settling a
//!    write left in flight by an abandoned tick),
//! 2. sample every metric target concurrently,
//! 3. aggregate, evaluate, stabilize,
//! 4. record the decision and publish it when it changes replicas.
//!
//! The whole tick runs under a hard deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_metrics::{aggregate, MetricsError, Sampler};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{DecisionLog, PublishedDecision};
use crate::error::AutoscalerError;
use crate::evaluator::{evaluate, Evaluation, MetricValue};
use crate::publisher::{ControlPlane, DecisionPublisher, PublishOutcome};
use crate::stabilization::{StabilizationPhase, StabilizationState};
use crate::telemetry::AutoscalerMetrics;
use crate::types::{ScalingDecision, ScalingPolicy, WorkloadId};

/// Default reconciliation period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(15);

/// Default tick deadline as a multiple of the period.
pub const DEFAULT_DEADLINE_FACTOR: u32 = 2;

/// Default first retry delay after a metric source failure.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// What a workload does when its replicas were changed by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Accept the operator's value and keep reconciling from it.
    #[default]
    Adopt,
    /// Stop publishing until explicitly resumed.
    Suspend,
}

/// Reconciler settings shared by all workloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Tick period.
    pub period: Duration,
    /// Tick deadline as a multiple of `period`.
    pub deadline_factor: u32,
    /// First retry delay after a metric source failure.
    pub backoff_base: Duration,
    /// Keep this many past decisions per workload, if set.
    pub history_capacity: Option<usize>,
    /// Reaction to manual overrides.
    pub on_conflict: ConflictPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            deadline_factor: DEFAULT_DEADLINE_FACTOR,
            backoff_base: DEFAULT_BACKOFF_BASE,
            history_capacity: None,
            on_conflict: ConflictPolicy::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Hard deadline for one tick.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.period.saturating_mul(self.deadline_factor.max(1))
    }

    /// Retry delay after `failures` consecutive source failures.
    ///
    /// Doubles from `backoff_base` and never exceeds the period.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1 << exponent)
            .min(self.period)
    }
}

/// A manual override seen by a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Workload identifier.
    pub workload: WorkloadId,
    /// Replica count the autoscaler last wrote.
    pub expected: u32,
    /// Replica count found on the control plane.
    pub found: u32,
    /// Decision that was being published, if any.
    pub decision: Option<Uuid>,
    /// When the conflict was detected.
    pub at: DateTime<Utc>,
}

/// Lifecycle phase of a workload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    /// Waiting for the next tick.
    #[default]
    Idle,
    /// A tick is running.
    Computing,
    /// Waiting to retry after a metric source failure.
    Backoff,
    /// Publishing is suspended after a conflict.
    Suspended,
}

/// What happened in one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// A new replica count was written.
    Published {
        /// Replicas before.
        from: u32,
        /// Replicas after.
        to: u32,
    },
    /// The control plane already held the desired count.
    Unchanged {
        /// Replica count.
        replicas: u32,
    },
    /// The stabilized count equals the current count.
    Stable {
        /// Replica count.
        replicas: u32,
    },
    /// No target had enough data.
    InsufficientData,
    /// A metric returned no series.
    Unavailable {
        /// Details.
        reason: String,
    },
    /// The metric source failed; a retry is scheduled.
    SourceFailure {
        /// Details.
        reason: String,
    },
    /// Replicas were changed outside the autoscaler.
    Conflict {
        /// Replica count the autoscaler last wrote.
        expected: u32,
        /// Replica count found.
        found: u32,
    },
    /// The control plane failed.
    ControlPlaneError {
        /// Details.
        reason: String,
    },
    /// The tick ran past its deadline and was abandoned.
    DeadlineExceeded,
    /// The policy is disabled.
    Disabled,
    /// The workload is suspended; nothing was done.
    Suspended,
}

impl TickOutcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::Unchanged { .. } => "unchanged",
            Self::Stable { .. } => "stable",
            Self::InsufficientData => "insufficient_data",
            Self::Unavailable { .. } => "unavailable",
            Self::SourceFailure { .. } => "source_failure",
            Self::Conflict { .. } => "conflict",
            Self::ControlPlaneError { .. } => "control_plane_error",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Disabled => "disabled",
            Self::Suspended => "suspended",
        }
    }

    /// Returns true if the tick completed without an error.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Published { .. }
                | Self::Unchanged { .. }
                | Self::Stable { .. }
                | Self::InsufficientData
                | Self::Disabled
        )
    }
}

impl std::fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// Workload identifier.
    pub workload: WorkloadId,
    /// Task phase.
    pub phase: WorkloadPhase,
    /// Stabilization phase after the last tick.
    pub stabilization: StabilizationPhase,
    /// Replica count observed by the last tick.
    pub current_replicas: Option<u32>,
    /// Outcome of the last tick.
    pub last_outcome: Option<TickOutcome>,
    /// Latest decision.
    pub latest_decision: Option<ScalingDecision>,
    /// Latest published decision.
    pub last_published: Option<PublishedDecision>,
    /// Past decisions, when history logging is on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ScalingDecision>,
    /// When the last tick ran.
    pub last_tick_at: Option<DateTime<Utc>>,
    /// When a tick last completed without error.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Last error, cleared on success.
    pub last_error: Option<String>,
    /// Failed ticks since the last success.
    pub consecutive_failures: u32,
}

impl WorkloadStatus {
    /// Status of a workload that has not ticked yet.
    #[must_use]
    pub fn new(workload: WorkloadId) -> Self {
        Self {
            workload,
            phase: WorkloadPhase::Idle,
            stabilization: StabilizationPhase::Stable,
            current_replicas: None,
            last_outcome: None,
            latest_decision: None,
            last_published: None,
            history: Vec::new(),
            last_tick_at: None,
            last_success_at: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    /// Returns true if no tick succeeded within `threshold` of `now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let Some(last) = self.last_success_at else {
            return true;
        };
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(last) > threshold
    }
}

/// Commands sent to a running workload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadControl {
    /// Leave the suspended state.
    Resume,
}

enum Wake {
    Tick,
    Retry,
    Resume,
    PolicyChanged,
    Stop,
}

/// Reconciles one workload.
pub struct WorkloadReconciler {
    workload: WorkloadId,
    policy: watch::Receiver<Arc<ScalingPolicy>>,
    sampler: Sampler,
    publisher: DecisionPublisher,
    stabilization: StabilizationState,
    log: DecisionLog,
    config: ReconcilerConfig,
    status: WorkloadStatus,
    status_tx: watch::Sender<WorkloadStatus>,
    conflicts: Option<mpsc::Sender<ConflictReport>>,
    metrics: Option<AutoscalerMetrics>,
    suspended: bool,
    /// Write that was in flight when its tick was abandoned.
    in_flight: Option<InFlightMove>,
    /// Source failures in a row; drives the retry backoff.
    source_failures: u32,
}

/// A replica write whose result was never seen.
#[derive(Debug, Clone, Copy)]
struct InFlightMove {
    decision: Uuid,
    from: u32,
    to: u32,
    at: DateTime<Utc>,
}

impl std::fmt::Debug for WorkloadReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadReconciler")
            .field("workload", &self.workload)
            .field("phase", &self.status.phase)
            .field("suspended", &self.suspended)
            .finish_non_exhaustive()
    }
}

impl WorkloadReconciler {
    /// Creates a reconciler and the receiver for its status.
    #[must_use]
    pub fn new(
        policy: watch::Receiver<Arc<ScalingPolicy>>,
        sampler: Sampler,
        control_plane: Arc<dyn ControlPlane>,
        config: ReconcilerConfig,
    ) -> (Self, watch::Receiver<WorkloadStatus>) {
        let workload = policy.borrow().workload.clone();
        let status = WorkloadStatus::new(workload.clone());
        let (status_tx, status_rx) = watch::channel(status.clone());
        let log = config
            .history_capacity
            .map_or_else(DecisionLog::new, DecisionLog::with_history);

        let reconciler = Self {
            publisher: DecisionPublisher::new(workload.clone(), control_plane),
            workload,
            policy,
            sampler,
            stabilization: StabilizationState::new(),
            log,
            config,
            status,
            status_tx,
            conflicts: None,
            metrics: None,
            suspended: false,
            in_flight: None,
            source_failures: 0,
        };
        (reconciler, status_rx)
    }

    /// Reports conflicts on `tx`.
    #[must_use]
    pub fn with_conflicts(mut self, tx: mpsc::Sender<ConflictReport>) -> Self {
        self.conflicts = Some(tx);
        self
    }

    /// Records telemetry in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: AutoscalerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The workload identifier.
    #[must_use]
    pub const fn workload(&self) -> &WorkloadId {
        &self.workload
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> &WorkloadStatus {
        &self.status
    }

    /// The decision log.
    #[must_use]
    pub const fn decision_log(&self) -> &DecisionLog {
        &self.log
    }

    /// The stabilization state.
    #[must_use]
    pub const fn stabilization(&self) -> &StabilizationState {
        &self.stabilization
    }

    /// Returns true while publishing is suspended.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Leaves the suspended state, adopting whatever the control plane holds.
    pub fn resume(&mut self) {
        if !self.suspended {
            return;
        }
        info!(workload = %self.workload, "resuming workload");
        self.suspended = false;
        self.publisher.forget_baseline();
        self.status.phase = WorkloadPhase::Idle;
        self.status_tx.send_replace(self.status.clone());
    }

    /// Runs ticks until cancelled or the tick channel closes.
    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<()>,
        mut control: mpsc::Receiver<WorkloadControl>,
        shutdown: CancellationToken,
    ) {
        info!(workload = %self.workload, "reconciler started");
        let mut retry_at: Option<Instant> = None;

        loop {
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let wake = tokio::select! {
                biased;
                () = shutdown.cancelled() => Wake::Stop,
                cmd = control.recv() => match cmd {
                    Some(WorkloadControl::Resume) => Wake::Resume,
                    None => Wake::Stop,
                },
                changed = self.policy.changed() => {
                    if changed.is_ok() { Wake::PolicyChanged } else { Wake::Stop }
                }
                tick = ticks.recv() => if tick.is_some() { Wake::Tick } else { Wake::Stop },
                () = retry => Wake::Retry,
            };

            match wake {
                Wake::Stop => break,
                Wake::Resume => {
                    self.resume();
                    continue;
                }
                Wake::PolicyChanged => {
                    info!(workload = %self.workload, "policy updated");
                    continue;
                }
                Wake::Retry => debug!(workload = %self.workload, "retrying after backoff"),
                Wake::Tick => {}
            }

            let outcome = self.tick_at(Utc::now()).await;
            retry_at = self.retry_delay(&outcome).map(|delay| Instant::now() + delay);
        }

        info!(workload = %self.workload, "reconciler stopped");
    }

    /// Delay before an early retry, if the outcome calls for one.
    #[must_use]
    pub fn retry_delay(&self, outcome: &TickOutcome) -> Option<Duration> {
        matches!(outcome, TickOutcome::SourceFailure { .. })
            .then(|| self.config.backoff(self.source_failures))
    }

    /// Runs one tick as of `now`.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if self.suspended {
            debug!(workload = %self.workload, "workload suspended, skipping tick");
            let outcome = TickOutcome::Suspended;
            self.finish(&outcome, now, Duration::ZERO);
            return outcome;
        }

        let started = Instant::now();
        self.status.phase = WorkloadPhase::Computing;
        self.status_tx.send_replace(self.status.clone());

        let deadline = self.config.deadline();
        let outcome = if let Ok(outcome) = tokio::time::timeout(deadline, self.reconcile(now)).await {
            outcome
        } else {
            let err = AutoscalerError::DeadlineExceeded {
                workload: self.workload.to_string(),
                deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            };
            warn!(workload = %self.workload, error = %err, "tick abandoned");
            self.publisher.forget_baseline();
            self.status.last_error = Some(err.to_string());
            TickOutcome::DeadlineExceeded
        };

        self.finish(&outcome, now, started.elapsed());
        outcome
    }

    async fn reconcile(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let policy = Arc::clone(&self.policy.borrow());
        if !policy.enabled {
            return TickOutcome::Disabled;
        }

        let current = match self.publisher.observe().await {
            Ok(current) => current,
            Err(e) => return self.control_plane_failure(e, None, now),
        };
        self.status.current_replicas = Some(current);
        self.settle_in_flight(current);

        let values = match self.sample(&policy, current, now).await {
            Ok(values) => values,
            Err(e) if e.is_source_failure() => {
                warn!(workload = %self.workload, error = %e, "metric source failed");
                self.status.last_error = Some(e.to_string());
                return TickOutcome::SourceFailure {
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                debug!(workload = %self.workload, error = %e, "metric unavailable");
                self.status.last_error = Some(e.to_string());
                return TickOutcome::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        let (desired, contributions) = match evaluate(&policy, &values, current) {
            Evaluation::NoChange { reason } => {
                debug!(workload = %self.workload, %reason, "no decision this tick");
                return TickOutcome::InsufficientData;
            }
            Evaluation::Desired {
                replicas,
                contributions,
                ..
            } => (replicas, contributions),
        };

        let target = self.stabilization.stabilize(&policy, current, desired, now);
        let decision = contributions.iter().fold(
            ScalingDecision::new(
                self.workload.clone(),
                current,
                target.replicas,
                target.reason.clone(),
                now,
            ),
            |decision, c| decision.with_metric(c.name.clone(), c.value),
        );
        self.log.record(decision.clone());
        if let Some(metrics) = &self.metrics {
            metrics.set_replicas(self.workload.as_str(), current, target.replicas);
        }

        if !target.is_change() {
            return TickOutcome::Stable { replicas: current };
        }

        self.in_flight = Some(InFlightMove {
            decision: decision.id,
            from: current,
            to: target.replicas,
            at: now,
        });
        let published = self.publisher.publish(&decision).await;
        self.in_flight = None;

        match published {
            Ok(outcome) => {
                self.log.mark_published(decision.id, outcome.clone(), now);
                match outcome {
                    PublishOutcome::Published { from, to } => {
                        self.stabilization.commit(from, to, now);
                        if let Some(metrics) = &self.metrics {
                            metrics.record_published(self.workload.as_str());
                        }
                        TickOutcome::Published { from, to }
                    }
                    PublishOutcome::Unchanged { replicas } => TickOutcome::Unchanged { replicas },
                }
            }
            Err(e) => self.control_plane_failure(e, Some(decision.id), now),
        }
    }

    /// Commits a write from an abandoned tick once the control plane shows it landed.
    fn settle_in_flight(&mut self, current: u32) {
        let Some(pending) = self.in_flight.take() else {
            return;
        };
        if current != pending.to {
            debug!(
                workload = %self.workload,
                expected = pending.to,
                found = current,
                "abandoned write did not land"
            );
            return;
        }

        info!(
            workload = %self.workload,
            from = pending.from,
            to = pending.to,
            "abandoned write landed, committing scale event"
        );
        self.stabilization.commit(pending.from, pending.to, pending.at);
        self.log.mark_published(
            pending.decision,
            PublishOutcome::Published {
                from: pending.from,
                to: pending.to,
            },
            pending.at,
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_published(self.workload.as_str());
        }
    }

    async fn sample(
        &self,
        policy: &ScalingPolicy,
        current: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<MetricValue>, MetricsError> {
        let end = now.timestamp_millis();
        let sampler = &self.sampler;

        let results = join_all(policy.targets.iter().map(|target| async move {
            let query = target.series_query();
            let labels = target.target_labels();
            let instances = sampler.sample_at(&query, &labels, end).await?;
            let value = aggregate(&instances, &target.aggregation_spec(), current);
            debug!(
                workload = %policy.workload,
                metric = %target.name,
                instances = instances.len(),
                value = ?value,
                "aggregated metric"
            );
            Ok::<_, MetricsError>(MetricValue::new(target.name.clone(), value))
        }))
        .await;

        let mut values = Vec::with_capacity(results.len());
        let mut unavailable = None;
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(e) if e.is_source_failure() => return Err(e),
                Err(e) => {
                    unavailable.get_or_insert(e);
                }
            }
        }

        match unavailable {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }

    fn control_plane_failure(
        &mut self,
        error: AutoscalerError,
        decision: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        self.status.last_error = Some(error.to_string());

        let AutoscalerError::Conflict {
            expected, found, ..
        } = error
        else {
            warn!(workload = %self.workload, error = %error, "control plane failed");
            return TickOutcome::ControlPlaneError {
                reason: error.to_string(),
            };
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_conflict(self.workload.as_str());
        }

        let report = ConflictReport {
            workload: self.workload.clone(),
            expected,
            found,
            decision,
            at: now,
        };
        if let Some(tx) = &self.conflicts {
            if tx.try_send(report).is_err() {
                warn!(workload = %self.workload, "conflict report dropped");
            }
        }

        match self.config.on_conflict {
            ConflictPolicy::Adopt => self.publisher.adopt(found),
            ConflictPolicy::Suspend => {
                warn!(workload = %self.workload, expected, found, "suspending workload after conflict");
                self.suspended = true;
            }
        }

        TickOutcome::Conflict { expected, found }
    }

    fn finish(&mut self, outcome: &TickOutcome, now: DateTime<Utc>, elapsed: Duration) {
        if outcome.is_success() {
            self.status.consecutive_failures = 0;
            self.status.last_success_at = Some(now);
            self.status.last_error = None;
        } else if !matches!(outcome, TickOutcome::Suspended | TickOutcome::Conflict { .. }) {
            self.status.consecutive_failures = self.status.consecutive_failures.saturating_add(1);
        }
        if matches!(outcome, TickOutcome::SourceFailure { .. }) {
            self.source_failures = self.source_failures.saturating_add(1);
        } else {
            self.source_failures = 0;
        }

        self.status.phase = if self.suspended {
            WorkloadPhase::Suspended
        } else if matches!(outcome, TickOutcome::SourceFailure { .. }) {
            WorkloadPhase::Backoff
        } else {
            WorkloadPhase::Idle
        };
        self.status.stabilization = self.stabilization.phase();
        self.status.last_outcome = Some(outcome.clone());
        self.status.last_tick_at = Some(now);
        self.status.latest_decision = self.log.latest().cloned();
        self.status.last_published = self.log.last_published().cloned();
        if self.log.keeps_history() {
            self.status.history = self.log.history();
        }
        self.status_tx.send_replace(self.status.clone());

        if let Some(metrics) = &self.metrics {
            metrics.record_tick(self.workload.as_str(), outcome.as_str());
            if !elapsed.is_zero() {
                metrics.observe_tick_duration(elapsed);
            }
        }

        debug!(
            workload = %self.workload,
            outcome = %outcome,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "tick finished"
        );
    }
}
