//! Session statistics
//!
//! Counters the surrounding analytics read to track camera activation and
//! fusion behavior of a monitoring session.

use crate::types::{FusionReason, PostureLabel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Running counters for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Completed ticks, gap ticks included
    pub ticks: u64,
    /// Ticks that produced a fusion decision
    pub decisions: u64,
    /// Ticks with no estimate from any source
    pub gap_ticks: u64,
    pub camera_invocations: u64,
    /// Ticks where the mode allowed the camera but the gate kept it closed
    pub camera_skipped: u64,
    pub estimator_timeouts: u64,
    pub estimator_failures: u64,
    /// Late camera results discarded because a newer tick had begun
    pub superseded_ticks: u64,
    /// Transitions of the warning flag from off to on
    pub warnings_raised: u64,
    pub label_changes: u64,
    /// Fused labels, before stabilization
    pub decision_labels: BTreeMap<PostureLabel, u64>,
    pub reasons: BTreeMap<FusionReason, u64>,
}

impl SessionStats {
    /// Share of completed ticks that invoked the camera (0-1)
    pub fn camera_activation_rate(&self) -> f64 {
        if self.ticks == 0 {
            return 0.0;
        }
        self.camera_invocations as f64 / self.ticks as f64
    }

    /// Share of decisions where the two sources disagreed (0-1)
    pub fn conflict_rate(&self) -> f64 {
        if self.decisions == 0 {
            return 0.0;
        }
        let conflicts: u64 = [
            FusionReason::SensorOverride,
            FusionReason::CameraOverride,
            FusionReason::TieBreakCamera,
        ]
        .iter()
        .filter_map(|reason| self.reasons.get(reason))
        .sum();
        conflicts as f64 / self.decisions as f64
    }

    pub(crate) fn record_decision(&mut self, label: PostureLabel, reason: FusionReason) {
        self.decisions += 1;
        *self.decision_labels.entry(label).or_insert(0) += 1;
        *self.reasons.entry(reason).or_insert(0) += 1;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
