//! Publishing replica counts to the workload control plane.
//!
//! The [`DecisionPublisher`] writes through a [`ControlPlane`] with
//! compare-and-set semantics. It remembers the last count it wrote (its
//! baseline) so that a manual override by an operator surfaces as a
//! [`AutoscalerError::Conflict`] instead of being silently overwritten.

use std::collections::HashMap;
use std::sync::Arc;

use claw_metrics::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AutoscalerError, Result};
use crate::types::{ScalingDecision, WorkloadId};

/// Replica state reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Current replica count.
    pub replicas: u32,
    /// Resource generation, if the control plane tracks one.
    pub generation: Option<u64>,
}

/// The workload control plane.
pub trait ControlPlane: Send + Sync {
    /// Returns a short name for logs.
    fn name(&self) -> &str;

    /// Reads the current replica count of a workload.
    ///
    /// # Errors
    ///
    /// Returns `WorkloadNotFound` or `ControlPlane` on failure.
    fn replicas<'a>(&'a self, workload: &'a WorkloadId) -> BoxFuture<'a, Result<ReplicaStatus>>;

    /// Sets the replica count if it still equals `expected`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the current count is not `expected`, and
    /// `WorkloadNotFound` or `ControlPlane` on failure.
    fn set_replicas<'a>(
        &'a self,
        workload: &'a WorkloadId,
        expected: u32,
        desired: u32,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Result of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// The replica count was changed.
    Published {
        /// Count before.
        from: u32,
        /// Count after.
        to: u32,
    },
    /// The control plane already held the desired count.
    Unchanged {
        /// The held count.
        replicas: u32,
    },
}

/// Publishes decisions for one workload.
pub struct DecisionPublisher {
    workload: WorkloadId,
    control_plane: Arc<dyn ControlPlane>,
    baseline: Option<u32>,
}

impl std::fmt::Debug for DecisionPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionPublisher")
            .field("workload", &self.workload)
            .field("control_plane", &self.control_plane.name())
            .field("baseline", &self.baseline)
            .finish()
    }
}

impl DecisionPublisher {
    /// Creates a publisher with no baseline.
    #[must_use]
    pub fn new(workload: WorkloadId, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            workload,
            control_plane,
            baseline: None,
        }
    }

    /// The last count written or adopted.
    #[must_use]
    pub const fn baseline(&self) -> Option<u32> {
        self.baseline
    }

    /// Accepts `replicas` as the new baseline (e.g. after an operator override).
    pub fn adopt(&mut self, replicas: u32) {
        info!(workload = %self.workload, replicas, "adopting replica count");
        self.baseline = Some(replicas);
    }

    /// Drops the baseline; the next observation is adopted as-is.
    pub fn forget_baseline(&mut self) {
        self.baseline = None;
    }

    fn check(&self, found: u32) -> Result<()> {
        match self.baseline {
            Some(expected) if expected != found => {
                warn!(
                    workload = %self.workload,
                    expected,
                    found,
                    "replica count changed outside the autoscaler"
                );
                Err(AutoscalerError::Conflict {
                    workload: self.workload.to_string(),
                    expected,
                    found,
                })
            }
            _ => Ok(()),
        }
    }

    /// Reads the current replica count.
    ///
    /// Without a baseline the observed count becomes the baseline.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the count differs from the baseline, or the
    /// control plane's error.
    pub async fn observe(&mut self) -> Result<u32> {
        let status = self.control_plane.replicas(&self.workload).await?;
        self.check(status.replicas)?;
        self.baseline = Some(status.replicas);
        Ok(status.replicas)
    }

    /// Publishes the decision's desired count.
    ///
    /// Publishing a count the control plane already holds is a no-op.
    /// Conflicts are returned, never retried.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` on a manual override or failed compare-and-set, or
    /// the control plane's error.
    pub async fn publish(&mut self, decision: &ScalingDecision) -> Result<PublishOutcome> {
        let status = self.control_plane.replicas(&self.workload).await?;
        self.check(status.replicas)?;

        let desired = decision.desired_replicas;
        if status.replicas == desired {
            debug!(workload = %self.workload, replicas = desired, "replica count already at desired");
            self.baseline = Some(desired);
            return Ok(PublishOutcome::Unchanged { replicas: desired });
        }

        self.control_plane
            .set_replicas(&self.workload, status.replicas, desired)
            .await?;
        self.baseline = Some(desired);

        info!(
            workload = %self.workload,
            decision = %decision.id,
            from = status.replicas,
            to = desired,
            "published replica count"
        );
        Ok(PublishOutcome::Published {
            from: status.replicas,
            to: desired,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WorkloadReplicas {
    replicas: u32,
    generation: u64,
    changes: u64,
}

/// In-memory control plane for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryControlPlane {
    workloads: RwLock<HashMap<WorkloadId, WorkloadReplicas>>,
    failure: RwLock<Option<AutoscalerError>>,
}

impl InMemoryControlPlane {
    /// Creates an empty control plane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workload at `replicas`.
    pub fn insert(&self, workload: &WorkloadId, replicas: u32) {
        self.workloads.write().insert(
            workload.clone(),
            WorkloadReplicas {
                replicas,
                ..WorkloadReplicas::default()
            },
        );
    }

    /// Sets replicas as an operator would, bypassing compare-and-set.
    pub fn override_replicas(&self, workload: &WorkloadId, replicas: u32) {
        let mut workloads = self.workloads.write();
        let entry = workloads.entry(workload.clone()).or_default();
        entry.replicas = replicas;
        entry.generation += 1;
    }

    /// Current replicas of a workload.
    #[must_use]
    pub fn current(&self, workload: &WorkloadId) -> Option<u32> {
        self.workloads.read().get(workload).map(|w| w.replicas)
    }

    /// Number of changes made through `set_replicas`.
    #[must_use]
    pub fn change_count(&self, workload: &WorkloadId) -> u64 {
        self.workloads.read().get(workload).map_or(0, |w| w.changes)
    }

    /// Makes every following call fail with `error` (or succeed again with `None`).
    pub fn set_failure(&self, error: Option<AutoscalerError>) {
        *self.failure.write() = error;
    }

    fn injected_failure(&self) -> Result<()> {
        self.failure.read().clone().map_or(Ok(()), Err)
    }

    fn read(&self, workload: &WorkloadId) -> Result<ReplicaStatus> {
        self.injected_failure()?;
        self.workloads
            .read()
            .get(workload)
            .map(|w| ReplicaStatus {
                replicas: w.replicas,
                generation: Some(w.generation),
            })
            .ok_or_else(|| AutoscalerError::WorkloadNotFound {
                workload: workload.to_string(),
            })
    }

    #[allow(clippy::significant_drop_tightening)]
    fn write(&self, workload: &WorkloadId, expected: u32, desired: u32) -> Result<()> {
        self.injected_failure()?;
        let mut workloads = self.workloads.write();
        let entry = workloads
            .get_mut(workload)
            .ok_or_else(|| AutoscalerError::WorkloadNotFound {
                workload: workload.to_string(),
            })?;

        if entry.replicas != expected {
            return Err(AutoscalerError::Conflict {
                workload: workload.to_string(),
                expected,
                found: entry.replicas,
            });
        }

        if entry.replicas != desired {
            entry.replicas = desired;
            entry.generation += 1;
            entry.changes += 1;
        }
        Ok(())
    }
}

impl ControlPlane for InMemoryControlPlane {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn replicas<'a>(&'a self, workload: &'a WorkloadId) -> BoxFuture<'a, Result<ReplicaStatus>> {
        Box::pin(async move { self.read(workload) })
    }

    fn set_replicas<'a>(
        &'a self,
        workload: &'a WorkloadId,
        expected: u32,
        desired: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write(workload, expected, desired) })
    }
}
