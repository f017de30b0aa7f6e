//! Decision audit trail.
//!
//! Every tick that reaches a decision records it here. Only the latest
//! decision is kept unless history logging is enabled, in which case a
//! bounded number of past decisions is retained as well.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::publisher::PublishOutcome;
use crate::types::ScalingDecision;

/// A decision that reached the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedDecision {
    /// The decision.
    pub decision: ScalingDecision,
    /// When it was published.
    pub published_at: DateTime<Utc>,
    /// What the control plane did.
    pub outcome: PublishOutcome,
}

/// Latest decision plus optional bounded history.
#[derive(Debug, Clone, Default)]
pub struct DecisionLog {
    latest: Option<ScalingDecision>,
    last_published: Option<PublishedDecision>,
    history: Option<VecDeque<ScalingDecision>>,
    capacity: usize,
}

impl DecisionLog {
    /// Creates a log that keeps only the latest decision.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log that also keeps up to `capacity` past decisions.
    #[must_use]
    pub fn with_history(capacity: usize) -> Self {
        Self {
            history: Some(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            ..Self::default()
        }
    }

    /// Records a decision, superseding the previous one.
    pub fn record(&mut self, decision: ScalingDecision) {
        info!(
            target: "claw_autoscaler::audit",
            workload = %decision.workload,
            decision = %decision.id,
            current = decision.current_replicas,
            desired = decision.desired_replicas,
            direction = ?decision.direction,
            reason = %decision.reason,
            "scaling decision"
        );

        if let Some(history) = self.history.as_mut() {
            if self.capacity > 0 {
                if history.len() == self.capacity {
                    history.pop_front();
                }
                history.push_back(decision.clone());
            }
        }
        self.latest = Some(decision);
    }

    /// Marks the decision with `id` as published.
    ///
    /// Returns false if `id` is not the latest decision.
    pub fn mark_published(&mut self, id: Uuid, outcome: PublishOutcome, at: DateTime<Utc>) -> bool {
        let Some(latest) = self.latest.as_ref().filter(|d| d.id == id) else {
            return false;
        };
        self.last_published = Some(PublishedDecision {
            decision: latest.clone(),
            published_at: at,
            outcome,
        });
        true
    }

    /// The most recent decision.
    #[must_use]
    pub const fn latest(&self) -> Option<&ScalingDecision> {
        self.latest.as_ref()
    }

    /// The most recent published decision.
    #[must_use]
    pub const fn last_published(&self) -> Option<&PublishedDecision> {
        self.last_published.as_ref()
    }

    /// Past decisions, oldest first. Empty when history logging is off.
    #[must_use]
    pub fn history(&self) -> Vec<ScalingDecision> {
        self.history
            .as_ref()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true when history logging is on.
    #[must_use]
    pub const fn keeps_history(&self) -> bool {
        self.history.is_some()
    }
}
