//! Stability filter
//!
//! Debounces fused decisions over a short rolling window before they become
//! the visible posture. The visible label only moves once a new label holds a
//! majority of the last N ticks, so a single noisy frame never reaches the
//! warning policy.

use crate::config::StabilityConfig;
use crate::types::{FusionDecision, PostureLabel, StableState};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Rolling label window owning the visible-label transition rule
#[derive(Debug, Clone)]
pub struct StabilityFilter {
    /// Most recent labels, oldest first; never longer than `capacity`
    window: VecDeque<PostureLabel>,
    capacity: usize,
    majority: usize,
}

impl Default for StabilityFilter {
    fn default() -> Self {
        Self::new(StabilityConfig::default())
    }
}

impl StabilityFilter {
    /// Create a filter; a zero-sized window is treated as a window of one
    pub fn new(config: StabilityConfig) -> Self {
        let capacity = config.window.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            majority: StabilityConfig { window: capacity }.majority(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn majority(&self) -> usize {
        self.majority
    }

    /// Labels currently in the window, oldest first
    pub fn window(&self) -> impl Iterator<Item = &PostureLabel> {
        self.window.iter()
    }

    /// Fold one tick into the window and return the next visible state.
    ///
    /// `decision` is `None` for a gap tick, which repeats the visible label in
    /// the window instead of voting.
    pub fn update(
        &mut self,
        current: &StableState,
        decision: Option<&FusionDecision>,
        now: DateTime<Utc>,
    ) -> StableState {
        let Some(decision) = decision else {
            if let Some(label) = current.label {
                self.push(label);
            }
            return current.clone();
        };

        self.push(decision.label);
        let mut next = current.clone();

        match current.label {
            None => {
                next.label = Some(decision.label);
                next.confidence = decision.confidence;
                next.last_changed_at = Some(now);
            }
            Some(label) if label == decision.label => {
                next.confidence = decision.confidence;
            }
            Some(_) => {
                if self.votes_for(decision.label) >= self.majority {
                    next.label = Some(decision.label);
                    next.confidence = decision.confidence;
                    next.last_changed_at = Some(now);
                }
            }
        }

        next
    }

    /// Drop all history
    pub fn clear(&mut self) {
        self.window.clear();
    }

    fn push(&mut self, label: PostureLabel) {
        self.window.push_back(label);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    fn votes_for(&self, label: PostureLabel) -> usize {
        self.window.iter().filter(|&&l| l == label).count()
    }
}
