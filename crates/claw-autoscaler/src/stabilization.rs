//! Stabilization of desired replica counts.
//!
//! [`StabilizationState`] smooths the evaluator's desired count with
//! per-direction stabilization windows and rate limits. Scale-ups react
//! quickly; scale-downs follow the highest recommendation seen in their
//! (longer) window and shrink by a small step per period.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ScaleDirection, ScalingPolicy, ScalingRules};

/// Phase of the per-workload state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StabilizationPhase {
    /// No transition this tick.
    #[default]
    Stable,
    /// Replicas are being increased.
    ScalingUp,
    /// Replicas are being decreased.
    ScalingDown,
}

/// A desired count recorded at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// When the recommendation was made.
    pub timestamp: DateTime<Utc>,
    /// Desired replicas.
    pub replicas: u32,
}

/// A committed replica change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleEvent {
    /// When the change was published.
    pub timestamp: DateTime<Utc>,
    /// Replicas before.
    pub from: u32,
    /// Replicas after.
    pub to: u32,
}

/// The stabilized outcome for one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilizedTarget {
    /// Replica count to publish (equal to current when `Stable`).
    pub replicas: u32,
    /// Resulting phase.
    pub phase: StabilizationPhase,
    /// Why this target was chosen.
    pub reason: String,
}

impl StabilizedTarget {
    fn hold(current: u32, reason: impl Into<String>) -> Self {
        Self {
            replicas: current,
            phase: StabilizationPhase::Stable,
            reason: reason.into(),
        }
    }

    fn moving(current: u32, replicas: u32, reason: impl Into<String>) -> Self {
        let phase = match ScaleDirection::between(current, replicas) {
            ScaleDirection::Up => StabilizationPhase::ScalingUp,
            ScaleDirection::Down => StabilizationPhase::ScalingDown,
            ScaleDirection::None => StabilizationPhase::Stable,
        };
        Self {
            replicas,
            phase,
            reason: reason.into(),
        }
    }

    /// Returns true if the target differs from the current count.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.phase != StabilizationPhase::Stable
    }
}

/// Per-workload stabilization history.
///
/// Owned by exactly one reconciler and mutated only through
/// [`StabilizationState::stabilize`] and [`StabilizationState::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilizationState {
    history: VecDeque<Recommendation>,
    events: VecDeque<ScaleEvent>,
    last_scale_up: Option<DateTime<Utc>>,
    last_scale_down: Option<DateTime<Utc>>,
    phase: StabilizationPhase,
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Start of the window of length `window` ending at `now`.
fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(chrono_duration(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn within(since: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    since.is_some_and(|t| now - t < chrono_duration(window))
}

impl StabilizationState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> StabilizationPhase {
        self.phase
    }

    /// Recorded recommendations, oldest first.
    #[must_use]
    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.history.iter().copied().collect()
    }

    /// Committed scale events still relevant for rate limiting.
    #[must_use]
    pub fn events(&self) -> Vec<ScaleEvent> {
        self.events.iter().copied().collect()
    }

    /// Time of the last committed scale-up.
    #[must_use]
    pub const fn last_scale_up(&self) -> Option<DateTime<Utc>> {
        self.last_scale_up
    }

    /// Time of the last committed scale-down.
    #[must_use]
    pub const fn last_scale_down(&self) -> Option<DateTime<Utc>> {
        self.last_scale_down
    }

    /// Stabilizes `desired` given `current` replicas at `now`.
    ///
    /// Records `desired` in the history. Does not mark anything as scaled;
    /// call [`StabilizationState::commit`] once the change is published.
    pub fn stabilize(
        &mut self,
        policy: &ScalingPolicy,
        current: u32,
        desired: u32,
        now: DateTime<Utc>,
    ) -> StabilizedTarget {
        self.history.push_back(Recommendation {
            timestamp: now,
            replicas: desired,
        });
        self.evict(policy, now);

        let target = if current < policy.min_replicas {
            StabilizedTarget::moving(current, policy.min_replicas, "current below minimum replicas")
        } else if current > policy.max_replicas {
            StabilizedTarget::moving(current, policy.max_replicas, "current above maximum replicas")
        } else if desired > current {
            self.stabilize_up(policy, current, desired, now)
        } else if desired < current {
            self.stabilize_down(policy, current, now)
        } else {
            StabilizedTarget::hold(current, "desired equals current")
        };

        let clamped = policy.clamp(target.replicas);
        let target = if clamped == target.replicas {
            target
        } else {
            StabilizedTarget::moving(current, clamped, target.reason)
        };

        debug!(
            workload = %policy.workload,
            current,
            desired,
            target = target.replicas,
            phase = ?target.phase,
            reason = %target.reason,
            "stabilized"
        );

        self.phase = target.phase;
        target
    }

    fn stabilize_up(
        &self,
        policy: &ScalingPolicy,
        current: u32,
        desired: u32,
        now: DateTime<Utc>,
    ) -> StabilizedTarget {
        let rules = &policy.scale_up;

        if within(self.last_scale_up, now, rules.stabilization_window) {
            return StabilizedTarget::hold(current, "scale-up stabilization window active");
        }

        if within(self.last_scale_down, now, rules.stabilization_window) {
            let exceeds = rules
                .rate_limit
                .allowed(current)
                .is_some_and(|allowed| desired - current > allowed);
            if !exceeds {
                return StabilizedTarget::hold(current, "recent scale-down; not reversing");
            }
        }

        let period_start = current.saturating_sub(self.moved_in_period(rules, now, ScaleDirection::Up));
        let Some(allowed) = rules.rate_limit.allowed(period_start) else {
            return StabilizedTarget::moving(current, desired, "scaling up");
        };

        let ceiling = period_start.saturating_add(allowed);
        if ceiling <= current {
            return StabilizedTarget::hold(current, "scale-up rate limit reached for period");
        }

        if desired > ceiling {
            StabilizedTarget::moving(current, ceiling, "scaling up, limited by rate")
        } else {
            StabilizedTarget::moving(current, desired, "scaling up")
        }
    }

    fn stabilize_down(
        &self,
        policy: &ScalingPolicy,
        current: u32,
        now: DateTime<Utc>,
    ) -> StabilizedTarget {
        let rules = &policy.scale_down;

        if within(self.last_scale_down, now, rules.stabilization_window) {
            return StabilizedTarget::hold(current, "scale-down stabilization window active");
        }

        // Highest recommendation within the window, including this tick's.
        let start = window_start(now, rules.stabilization_window);
        let recommended = self
            .history
            .iter()
            .filter(|r| r.timestamp >= start)
            .map(|r| r.replicas)
            .max()
            .unwrap_or(current);

        if recommended >= current {
            return StabilizedTarget::hold(current, "higher recommendation within scale-down window");
        }

        if within(self.last_scale_up, now, rules.stabilization_window) {
            let exceeds = rules
                .rate_limit
                .allowed(current)
                .is_some_and(|allowed| current - recommended > allowed);
            if !exceeds {
                return StabilizedTarget::hold(current, "recent scale-up; not reversing");
            }
        }

        let period_start =
            current.saturating_add(self.moved_in_period(rules, now, ScaleDirection::Down));
        let Some(allowed) = rules.rate_limit.allowed(period_start) else {
            return StabilizedTarget::moving(current, recommended, "scaling down");
        };

        let floor = period_start.saturating_sub(allowed);
        if floor >= current {
            return StabilizedTarget::hold(current, "scale-down rate limit reached for period");
        }

        if recommended < floor {
            StabilizedTarget::moving(current, floor, "scaling down, limited by rate")
        } else {
            StabilizedTarget::moving(current, recommended, "scaling down")
        }
    }

    /// Replicas moved in `direction` by events inside the rate-limit period.
    fn moved_in_period(&self, rules: &ScalingRules, now: DateTime<Utc>, direction: ScaleDirection) -> u32 {
        let since = window_start(now, rules.rate_limit.period);
        self.events
            .iter()
            .filter(|e| e.timestamp > since)
            .map(|e| match direction {
                ScaleDirection::Up => e.to.saturating_sub(e.from),
                ScaleDirection::Down => e.from.saturating_sub(e.to),
                ScaleDirection::None => 0,
            })
            .sum()
    }

    fn evict(&mut self, policy: &ScalingPolicy, now: DateTime<Utc>) {
        let cutoff = window_start(now, policy.longest_window());
        while self.history.front().is_some_and(|r| r.timestamp < cutoff) {
            self.history.pop_front();
        }
        while self.events.front().is_some_and(|e| e.timestamp < cutoff) {
            self.events.pop_front();
        }
    }

    /// Records a published change from `from` to `to` replicas.
    pub fn commit(&mut self, from: u32, to: u32, now: DateTime<Utc>) {
        match ScaleDirection::between(from, to) {
            ScaleDirection::Up => self.last_scale_up = Some(now),
            ScaleDirection::Down => self.last_scale_down = Some(now),
            ScaleDirection::None => return,
        }
        self.events.push_back(ScaleEvent {
            timestamp: now,
            from,
            to,
        });
    }
}
