//! Core types for the posture fusion core
//!
//! This module defines the values that flow through a tick: sensor readings,
//! per-source estimates, fusion decisions, the visible stable state and the
//! tick output handed to external collaborators.

use crate::error::FusionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Number of pressure channels in a sensor reading
pub const SENSOR_CHANNELS: usize = 7;

/// Sitting posture classes shared by both estimators
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PostureLabel {
    #[serde(rename = "Correct_posture")]
    CorrectPosture,
    #[serde(rename = "Leaning_backward")]
    LeaningBackward,
    #[serde(rename = "Leaning_forward")]
    LeaningForward,
    #[serde(rename = "Leaning_left")]
    LeaningLeft,
    #[serde(rename = "Leaning_right")]
    LeaningRight,
    #[serde(rename = "Left_leg_crossed")]
    LeftLegCrossed,
    #[serde(rename = "Right_leg_crossed")]
    RightLegCrossed,
    #[serde(rename = "Sitting_at_front_edge")]
    SittingAtFrontEdge,
    #[serde(rename = "Upper_body_hunched")]
    UpperBodyHunched,
}

impl PostureLabel {
    /// Every label, in classifier order
    pub const ALL: [PostureLabel; 9] = [
        PostureLabel::CorrectPosture,
        PostureLabel::LeaningBackward,
        PostureLabel::LeaningForward,
        PostureLabel::LeaningLeft,
        PostureLabel::LeaningRight,
        PostureLabel::LeftLegCrossed,
        PostureLabel::RightLegCrossed,
        PostureLabel::SittingAtFrontEdge,
        PostureLabel::UpperBodyHunched,
    ];

    /// Class name as emitted by the trained classifiers
    pub fn as_str(&self) -> &'static str {
        match self {
            PostureLabel::CorrectPosture => "Correct_posture",
            PostureLabel::LeaningBackward => "Leaning_backward",
            PostureLabel::LeaningForward => "Leaning_forward",
            PostureLabel::LeaningLeft => "Leaning_left",
            PostureLabel::LeaningRight => "Leaning_right",
            PostureLabel::LeftLegCrossed => "Left_leg_crossed",
            PostureLabel::RightLegCrossed => "Right_leg_crossed",
            PostureLabel::SittingAtFrontEdge => "Sitting_at_front_edge",
            PostureLabel::UpperBodyHunched => "Upper_body_hunched",
        }
    }

    pub fn is_correct(&self) -> bool {
        matches!(self, PostureLabel::CorrectPosture)
    }

    /// Every label except correct posture counts towards warnings
    pub fn is_bad(&self) -> bool {
        !self.is_correct()
    }

    /// Front-loaded postures produce near-identical pressure maps on the seat
    /// array, so a confident sensor vote for one of them still asks the camera.
    pub fn needs_visual_confirmation(&self) -> bool {
        matches!(
            self,
            PostureLabel::LeaningForward
                | PostureLabel::UpperBodyHunched
                | PostureLabel::SittingAtFrontEdge
        )
    }
}

impl fmt::Display for PostureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostureLabel {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        PostureLabel::ALL
            .iter()
            .copied()
            .find(|label| label.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| FusionError::InvalidEstimate(format!("unknown posture label: {s}")))
    }
}

/// Which estimator produced an estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateSource {
    Sensor,
    Camera,
}

impl EstimateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimateSource::Sensor => "sensor",
            EstimateSource::Camera => "camera",
        }
    }
}

impl fmt::Display for EstimateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode of a monitoring session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionMode {
    #[serde(rename = "sensor_only")]
    SensorOnly,
    #[serde(rename = "camera_only")]
    CameraOnly,
    #[serde(rename = "auto", alias = "auto_smart")]
    AutoSmart,
    #[serde(rename = "fusion")]
    Fusion,
}

impl Default for DetectionMode {
    fn default() -> Self {
        DetectionMode::AutoSmart
    }
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::SensorOnly => "sensor_only",
            DetectionMode::CameraOnly => "camera_only",
            DetectionMode::AutoSmart => "auto",
            DetectionMode::Fusion => "fusion",
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMode {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sensor_only" => Ok(DetectionMode::SensorOnly),
            "camera_only" => Ok(DetectionMode::CameraOnly),
            "auto" | "auto_smart" => Ok(DetectionMode::AutoSmart),
            "fusion" => Ok(DetectionMode::Fusion),
            other => Err(FusionError::InvalidConfig(format!("unknown mode: {other}"))),
        }
    }
}

/// Latest 7-channel pressure reading from the seat array
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub channels: [f64; SENSOR_CHANNELS],
}

impl SensorReading {
    /// Build a reading, rejecting non-finite channel values
    pub fn new(channels: [f64; SENSOR_CHANNELS]) -> Result<Self, FusionError> {
        if let Some(idx) = channels.iter().position(|v| !v.is_finite()) {
            return Err(FusionError::InvalidReading(format!(
                "sensor{} is not a finite value",
                idx + 1
            )));
        }
        Ok(Self { channels })
    }

    /// Build a reading from a slice that must hold exactly 7 values
    pub fn from_slice(values: &[f64]) -> Result<Self, FusionError> {
        let channels: [f64; SENSOR_CHANNELS] = values.try_into().map_err(|_| {
            FusionError::InvalidReading(format!(
                "expected {} sensor values, got {}",
                SENSOR_CHANNELS,
                values.len()
            ))
        })?;
        Self::new(channels)
    }
}

/// A single estimator's opinion for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub label: PostureLabel,
    /// Classifier confidence (0-1)
    pub confidence: f64,
    pub source: EstimateSource,
    pub timestamp: DateTime<Utc>,
}

impl Estimate {
    pub fn new(
        label: PostureLabel,
        confidence: f64,
        source: EstimateSource,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, FusionError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(FusionError::InvalidEstimate(format!(
                "{source} confidence {confidence} outside [0, 1]"
            )));
        }
        Ok(Self {
            label,
            confidence,
            source,
            timestamp,
        })
    }

    pub fn sensor(
        label: PostureLabel,
        confidence: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, FusionError> {
        Self::new(label, confidence, EstimateSource::Sensor, timestamp)
    }

    pub fn camera(
        label: PostureLabel,
        confidence: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, FusionError> {
        Self::new(label, confidence, EstimateSource::Camera, timestamp)
    }

    /// Confidence is a finite value in [0, 1]
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
    }
}

/// What an estimator call produced
#[derive(Debug, Clone, PartialEq)]
pub enum EstimateOutcome {
    Ready(Estimate),
    /// No person/reading to classify; not an error
    Unavailable,
    /// The caller's deadline elapsed before the estimator answered
    TimedOut,
    Failed(String),
}

impl EstimateOutcome {
    pub fn estimate(&self) -> Option<&Estimate> {
        match self {
            EstimateOutcome::Ready(estimate) => Some(estimate),
            _ => None,
        }
    }

    pub fn into_estimate(self) -> Option<Estimate> {
        match self {
            EstimateOutcome::Ready(estimate) => Some(estimate),
            _ => None,
        }
    }

    /// Error describing why this outcome carries no estimate, if it was a failure
    pub fn failure(&self, source: EstimateSource) -> Option<FusionError> {
        match self {
            EstimateOutcome::TimedOut => Some(FusionError::EstimatorTimeout(source)),
            EstimateOutcome::Failed(reason) => Some(FusionError::EstimatorFailed {
                estimator: source,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

impl From<Option<Estimate>> for EstimateOutcome {
    fn from(estimate: Option<Estimate>) -> Self {
        match estimate {
            Some(estimate) => EstimateOutcome::Ready(estimate),
            None => EstimateOutcome::Unavailable,
        }
    }
}

/// Non-estimate outcomes in their serialized form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Unavailable,
    Timeout,
    Failed,
}

/// Serialized estimator outcome, as exchanged over the C ABI and in replay files.
///
/// Either an estimate object (`timestamp` optional, defaulting to the tick
/// time) or `{"status": "unavailable" | "timeout" | "failed", "reason": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutcomeRecord {
    Estimate {
        label: PostureLabel,
        confidence: f64,
        source: EstimateSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    Status {
        status: OutcomeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl OutcomeRecord {
    /// Convert to an outcome; range checks happen when the session accepts it
    pub fn into_outcome(self, now: DateTime<Utc>) -> EstimateOutcome {
        match self {
            OutcomeRecord::Estimate {
                label,
                confidence,
                source,
                timestamp,
            } => EstimateOutcome::Ready(Estimate {
                label,
                confidence,
                source,
                timestamp: timestamp.unwrap_or(now),
            }),
            OutcomeRecord::Status { status, reason } => match status {
                OutcomeStatus::Unavailable => EstimateOutcome::Unavailable,
                OutcomeStatus::Timeout => EstimateOutcome::TimedOut,
                OutcomeStatus::Failed => {
                    EstimateOutcome::Failed(reason.unwrap_or_else(|| "unspecified".to_string()))
                }
            },
        }
    }

    pub fn from_json(json: &str, now: DateTime<Utc>) -> Result<EstimateOutcome, FusionError> {
        let record: Self = serde_json::from_str(json)
            .map_err(|e| FusionError::InvalidEstimate(e.to_string()))?;
        Ok(record.into_outcome(now))
    }
}

/// How the fusion engine arrived at its label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionReason {
    SensorOnlyFallback,
    CameraOnlyFallback,
    AgreementBoost,
    SensorOverride,
    CameraOverride,
    TieBreakCamera,
}

impl FusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionReason::SensorOnlyFallback => "sensor_only_fallback",
            FusionReason::CameraOnlyFallback => "camera_only_fallback",
            FusionReason::AgreementBoost => "agreement_boost",
            FusionReason::SensorOverride => "sensor_override",
            FusionReason::CameraOverride => "camera_override",
            FusionReason::TieBreakCamera => "tie_break_camera",
        }
    }

    /// Fallback reason for a lone estimate from `source`
    pub fn fallback_for(source: EstimateSource) -> Self {
        match source {
            EstimateSource::Sensor => FusionReason::SensorOnlyFallback,
            EstimateSource::Camera => FusionReason::CameraOnlyFallback,
        }
    }
}

impl fmt::Display for FusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the fusion engine for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionDecision {
    pub label: PostureLabel,
    pub confidence: f64,
    pub contributing_sources: BTreeSet<EstimateSource>,
    pub reason: FusionReason,
    /// Weighted sensor score, only set when the sources disagreed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_score: Option<f64>,
    /// Weighted camera score, only set when the sources disagreed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_score: Option<f64>,
}

/// The externally visible posture of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StableState {
    /// `None` until the first decision of the session
    pub label: Option<PostureLabel>,
    pub confidence: f64,
    pub mode: DetectionMode,
    pub warning: bool,
    pub last_changed_at: Option<DateTime<Utc>>,
}

impl StableState {
    pub fn new(mode: DetectionMode) -> Self {
        Self {
            label: None,
            confidence: 0.0,
            mode,
            warning: false,
            last_changed_at: None,
        }
    }

    pub fn is_correct(&self) -> bool {
        self.label.map_or(false, |label| label.is_correct())
    }
}

impl Default for StableState {
    fn default() -> Self {
        Self::new(DetectionMode::default())
    }
}

/// Bad-posture streak tracked by the warning policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarningState {
    pub consecutive_bad_ticks: u32,
    /// First bad tick of the current streak
    pub window_start: Option<DateTime<Utc>>,
    /// Most recent bad tick of the current streak
    pub last_bad_at: Option<DateTime<Utc>>,
    pub is_warning: bool,
}

/// Result of one tick, as persisted/broadcast by the surrounding service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickOutput {
    pub session_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub label: Option<PostureLabel>,
    pub confidence: f64,
    pub mode: DetectionMode,
    pub warning: bool,
    /// `None` when no new decision was made this tick
    pub fusion_reason: Option<FusionReason>,
    pub reason_detail: String,
    pub contributing_sources: BTreeSet<EstimateSource>,
    pub sensor_confidence: Option<f64>,
    pub camera_confidence: Option<f64>,
    pub camera_invoked: bool,
    /// The previous stable state was reported unchanged
    pub stale: bool,
}
