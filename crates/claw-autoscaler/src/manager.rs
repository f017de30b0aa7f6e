//! Autoscaler manager for coordinating per-workload reconcilers.
//!
//! The manager is the single timer of the process. It spawns one
//! [`WorkloadReconciler`] task per policy, offers every task a tick each
//! period, and applies policy reloads. It is driven through a
//! [`ManagerHandle`]; all state lives inside the manager task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use claw_metrics::Sampler;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LoadReport, RejectedPolicy};
use crate::error::{AutoscalerError, Result};
use crate::publisher::ControlPlane;
use crate::reconciler::{
    ConflictReport, ReconcilerConfig, WorkloadControl, WorkloadReconciler, WorkloadStatus,
};
use crate::telemetry::AutoscalerMetrics;
use crate::types::{ScalingPolicy, WorkloadId};

/// Capacity of the operator conflict channel.
pub const CONFLICT_CHANNEL_CAPACITY: usize = 64;

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
    /// Newly started workloads.
    pub added: Vec<WorkloadId>,
    /// Workloads whose policy changed.
    pub updated: Vec<WorkloadId>,
    /// Stopped workloads.
    pub removed: Vec<WorkloadId>,
    /// Policies that were rejected; running workloads keep their old policy.
    pub rejected: Vec<RejectedPolicy>,
}

impl ReloadSummary {
    /// Returns true if the reload changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Commands accepted by the manager task.
#[derive(Debug)]
pub enum ManagerCommand {
    /// Apply a freshly loaded policy document.
    Reload(LoadReport, oneshot::Sender<ReloadSummary>),
    /// Resume a suspended workload.
    Resume(WorkloadId, oneshot::Sender<Result<()>>),
    /// Snapshot every workload's status.
    Statuses(oneshot::Sender<Vec<WorkloadStatus>>),
    /// Stop all workloads and exit.
    Shutdown,
}

/// Cloneable handle to a running manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<ManagerCommand>,
    metrics: AutoscalerMetrics,
}

impl ManagerHandle {
    /// Applies a policy document.
    ///
    /// # Errors
    ///
    /// Returns `ManagerStopped` if the manager is no longer running.
    pub async fn reload(&self, report: LoadReport) -> Result<ReloadSummary> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Reload(report, tx)).await?;
        rx.await.map_err(|_| AutoscalerError::ManagerStopped)
    }

    /// Resumes a workload suspended after a conflict.
    ///
    /// # Errors
    ///
    /// Returns `WorkloadNotFound` for an unknown workload, or
    /// `ManagerStopped` if the manager is no longer running.
    pub async fn resume(&self, workload: WorkloadId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Resume(workload, tx)).await?;
        rx.await.map_err(|_| AutoscalerError::ManagerStopped)?
    }

    /// Returns the status of every workload, ordered by workload.
    ///
    /// # Errors
    ///
    /// Returns `ManagerStopped` if the manager is no longer running.
    pub async fn statuses(&self) -> Result<Vec<WorkloadStatus>> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Statuses(tx)).await?;
        rx.await.map_err(|_| AutoscalerError::ManagerStopped)
    }

    /// Asks the manager to stop. Returns immediately.
    pub async fn shutdown(&self) {
        if self.commands.send(ManagerCommand::Shutdown).await.is_err() {
            debug!("manager already stopped");
        }
    }

    /// Resolves once the manager has stopped.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }

    /// Shared telemetry.
    #[must_use]
    pub const fn metrics(&self) -> &AutoscalerMetrics {
        &self.metrics
    }

    async fn send(&self, command: ManagerCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AutoscalerError::ManagerStopped)
    }
}

struct WorkloadHandle {
    policy_tx: watch::Sender<Arc<ScalingPolicy>>,
    tick_tx: mpsc::Sender<()>,
    control_tx: mpsc::Sender<WorkloadControl>,
    status_rx: watch::Receiver<WorkloadStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Coordinates all workload reconcilers.
pub struct AutoscalerManager {
    sampler: Sampler,
    control_plane: Arc<dyn ControlPlane>,
    config: ReconcilerConfig,
    metrics: AutoscalerMetrics,
    conflicts_tx: mpsc::Sender<ConflictReport>,
    commands: mpsc::Receiver<ManagerCommand>,
    workloads: BTreeMap<WorkloadId, WorkloadHandle>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for AutoscalerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoscalerManager")
            .field("control_plane", &self.control_plane.name())
            .field("config", &self.config)
            .field("workloads", &self.workloads.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl AutoscalerManager {
    /// Creates a manager, its handle and the operator conflict channel.
    #[must_use]
    pub fn new(
        sampler: Sampler,
        control_plane: Arc<dyn ControlPlane>,
        config: ReconcilerConfig,
        metrics: AutoscalerMetrics,
    ) -> (Self, ManagerHandle, mpsc::Receiver<ConflictReport>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (conflicts_tx, conflicts_rx) = mpsc::channel(CONFLICT_CHANNEL_CAPACITY);
        let handle = ManagerHandle {
            commands: commands_tx,
            metrics: metrics.clone(),
        };
        let manager = Self {
            sampler,
            control_plane,
            config,
            metrics,
            conflicts_tx,
            commands,
            workloads: BTreeMap::new(),
            shutdown: CancellationToken::new(),
        };
        (manager, handle, conflicts_rx)
    }

    /// Cancels the manager and every workload when `token` is cancelled.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Number of running workloads.
    #[must_use]
    pub fn workload_count(&self) -> usize {
        self.workloads.len()
    }

    /// Applies a policy document.
    ///
    /// Must be called from within a tokio runtime.
    pub fn apply(&mut self, report: LoadReport) -> ReloadSummary {
        let mut summary = ReloadSummary {
            rejected: report.rejected,
            ..ReloadSummary::default()
        };

        let mut named: BTreeSet<WorkloadId> = summary
            .rejected
            .iter()
            .map(|r| WorkloadId::new(r.workload.clone()))
            .collect();

        for rejected in &summary.rejected {
            let id = WorkloadId::new(rejected.workload.clone());
            if self.workloads.contains_key(&id) {
                warn!(workload = %id, reason = %rejected.reason, "keeping previous policy");
            }
        }

        for policy in report.policies {
            let id = policy.workload.clone();
            named.insert(id.clone());

            if let Some(handle) = self.workloads.get(&id) {
                let changed = **handle.policy_tx.borrow() != policy;
                if changed {
                    handle.policy_tx.send_replace(Arc::new(policy));
                    info!(workload = %id, "policy updated");
                    summary.updated.push(id);
                }
            } else {
                self.spawn(policy);
                summary.added.push(id);
            }
        }

        let removed: Vec<WorkloadId> = self
            .workloads
            .keys()
            .filter(|id| !named.contains(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(handle) = self.workloads.remove(&id) {
                handle.cancel.cancel();
                self.metrics.forget_workload(id.as_str());
                info!(workload = %id, "workload removed");
                summary.removed.push(id);
            }
        }

        info!(
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            rejected = summary.rejected.len(),
            "applied policy document"
        );
        summary
    }

    fn spawn(&mut self, policy: ScalingPolicy) {
        let id = policy.workload.clone();
        let (policy_tx, policy_rx) = watch::channel(Arc::new(policy));
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (control_tx, control_rx) = mpsc::channel(4);
        let cancel = self.shutdown.child_token();

        let (reconciler, status_rx) = WorkloadReconciler::new(
            policy_rx,
            self.sampler.clone(),
            Arc::clone(&self.control_plane),
            self.config.clone(),
        );
        let reconciler = reconciler
            .with_conflicts(self.conflicts_tx.clone())
            .with_metrics(self.metrics.clone());
        let task = tokio::spawn(reconciler.run(tick_rx, control_rx, cancel.clone()));

        info!(workload = %id, "workload started");
        self.workloads.insert(
            id,
            WorkloadHandle {
                policy_tx,
                tick_tx,
                control_tx,
                status_rx,
                cancel,
                task,
            },
        );
    }

    /// Offers one tick to every workload. Busy workloads skip it.
    pub fn tick(&self) {
        for (id, handle) in &self.workloads {
            match handle.tick_tx.try_send(()) {
                Ok(()) => {}
                Err(TrySendError::Full(())) => {
                    debug!(workload = %id, "workload busy, skipping tick");
                    self.metrics.record_skipped(id.as_str());
                }
                Err(TrySendError::Closed(())) => {
                    warn!(workload = %id, "workload task has exited");
                }
            }
        }
    }

    /// Status of every workload, ordered by workload.
    #[must_use]
    pub fn statuses(&self) -> Vec<WorkloadStatus> {
        self.workloads
            .values()
            .map(|h| h.status_rx.borrow().clone())
            .collect()
    }

    fn resume(&self, id: &WorkloadId) -> Result<()> {
        let handle = self
            .workloads
            .get(id)
            .ok_or_else(|| AutoscalerError::WorkloadNotFound {
                workload: id.to_string(),
            })?;
        if handle.control_tx.try_send(WorkloadControl::Resume).is_err() {
            warn!(workload = %id, "resume not delivered");
        }
        Ok(())
    }

    /// Runs the manager until shutdown.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            period_ms = u64::try_from(self.config.period.as_millis()).unwrap_or(u64::MAX),
            "autoscaler manager started"
        );

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.tick(),
                cmd = self.commands.recv() => match cmd {
                    Some(ManagerCommand::Reload(report, reply)) => {
                        let summary = self.apply(report);
                        let _ = reply.send(summary);
                    }
                    Some(ManagerCommand::Resume(id, reply)) => {
                        let _ = reply.send(self.resume(&id));
                    }
                    Some(ManagerCommand::Statuses(reply)) => {
                        let _ = reply.send(self.statuses());
                    }
                    Some(ManagerCommand::Shutdown) | None => break,
                },
            }
        }

        self.stop().await;
    }

    async fn stop(&mut self) {
        info!(workloads = self.workloads.len(), "stopping autoscaler manager");
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut self.workloads)
            .into_values()
            .map(|h| h.task);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "workload task failed");
            }
        }
        info!("autoscaler manager stopped");
    }
}
