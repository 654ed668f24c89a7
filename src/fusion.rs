//! Fusion engine
//!
//! Combines the estimates available this tick into one decision. Rules are
//! applied in order and the first match wins:
//!
//! 1. No estimate at all fails with `NoEstimateAvailable`.
//! 2. A lone estimate passes through unchanged (`<Source>OnlyFallback`).
//! 3. Agreeing labels keep the higher confidence (`AgreementBoost`).
//! 4. Disagreeing labels are arbitrated by `weight * confidence`; the winner
//!    reports its own confidence and an exact tie goes to the camera.

use crate::config::FusionWeights;
use crate::error::FusionError;
use crate::types::{Estimate, EstimateSource, FusionDecision, FusionReason};
use std::collections::BTreeSet;

/// Weighted scores closer than this are a tie
pub const SCORE_TIE_EPSILON: f64 = 1e-9;

/// Fuse the estimates of one tick
pub fn fuse(
    sensor: Option<&Estimate>,
    camera: Option<&Estimate>,
    weights: &FusionWeights,
) -> Result<FusionDecision, FusionError> {
    match (sensor, camera) {
        (None, None) => Err(FusionError::NoEstimateAvailable),
        (Some(only), None) => Ok(single_source(only, EstimateSource::Sensor)),
        (None, Some(only)) => Ok(single_source(only, EstimateSource::Camera)),
        (Some(sensor), Some(camera)) if sensor.label == camera.label => Ok(FusionDecision {
            label: sensor.label,
            confidence: sensor.confidence.max(camera.confidence),
            contributing_sources: both_sources(),
            reason: FusionReason::AgreementBoost,
            sensor_score: None,
            camera_score: None,
        }),
        (Some(sensor), Some(camera)) => Ok(arbitrate(sensor, camera, weights)),
    }
}

fn single_source(estimate: &Estimate, source: EstimateSource) -> FusionDecision {
    FusionDecision {
        label: estimate.label,
        confidence: estimate.confidence,
        contributing_sources: BTreeSet::from([source]),
        reason: FusionReason::fallback_for(source),
        sensor_score: None,
        camera_score: None,
    }
}

fn both_sources() -> BTreeSet<EstimateSource> {
    BTreeSet::from([EstimateSource::Sensor, EstimateSource::Camera])
}

fn arbitrate(sensor: &Estimate, camera: &Estimate, weights: &FusionWeights) -> FusionDecision {
    let sensor_score = weights.sensor * sensor.confidence;
    let camera_score = weights.camera * camera.confidence;

    let (winner, reason) = if (sensor_score - camera_score).abs() <= SCORE_TIE_EPSILON {
        (camera, FusionReason::TieBreakCamera)
    } else if sensor_score > camera_score {
        (sensor, FusionReason::SensorOverride)
    } else {
        (camera, FusionReason::CameraOverride)
    };

    FusionDecision {
        label: winner.label,
        confidence: winner.confidence,
        contributing_sources: both_sources(),
        reason,
        sensor_score: Some(sensor_score),
        camera_score: Some(camera_score),
    }
}

/// Human-readable account of a decision, as stored next to each tick
pub fn describe(
    decision: &FusionDecision,
    sensor: Option<&Estimate>,
    camera: Option<&Estimate>,
) -> String {
    match decision.reason {
        FusionReason::SensorOnlyFallback => match sensor {
            Some(s) => format!("Sensor only ({:.2})", s.confidence),
            None => "Sensor only".to_string(),
        },
        FusionReason::CameraOnlyFallback => match camera {
            Some(c) => format!("Camera only ({:.2})", c.confidence),
            None => "Camera only".to_string(),
        },
        FusionReason::AgreementBoost => "Both models agree".to_string(),
        FusionReason::SensorOverride
        | FusionReason::CameraOverride
        | FusionReason::TieBreakCamera => {
            let sensor_label = sensor.map(|s| s.label.as_str()).unwrap_or("-");
            let camera_label = camera.map(|c| c.label.as_str()).unwrap_or("-");
            format!(
                "Conflict: S={}, C={} -> {} ({})",
                sensor_label, camera_label, decision.label, decision.reason
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PostureLabel;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn weights() -> FusionWeights {
        FusionWeights::new(0.4, 0.6).unwrap()
    }

    fn sensor(label: PostureLabel, confidence: f64) -> Estimate {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        Estimate::sensor(label, confidence, now).unwrap()
    }

    fn camera(label: PostureLabel, confidence: f64) -> Estimate {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        Estimate::camera(label, confidence, now).unwrap()
    }

    #[test]
    fn test_no_estimate_fails() {
        let err = fuse(None, None, &weights()).unwrap_err();
        assert!(matches!(err, FusionError::NoEstimateAvailable));
    }

    #[test]
    fn test_sensor_only_passthrough() {
        let s = sensor(PostureLabel::LeaningLeft, 0.42);
        let decision = fuse(Some(&s), None, &weights()).unwrap();

        assert_eq!(decision.label, PostureLabel::LeaningLeft);
        assert_eq!(decision.confidence, 0.42);
        assert_eq!(decision.reason, FusionReason::SensorOnlyFallback);
        assert_eq!(
            decision.contributing_sources,
            BTreeSet::from([EstimateSource::Sensor])
        );
    }

    #[test]
    fn test_camera_only_passthrough() {
        let c = camera(PostureLabel::UpperBodyHunched, 0.81);
        let decision = fuse(None, Some(&c), &weights()).unwrap();

        assert_eq!(decision.label, PostureLabel::UpperBodyHunched);
        assert_eq!(decision.confidence, 0.81);
        assert_eq!(decision.reason, FusionReason::CameraOnlyFallback);
    }

    #[test]
    fn test_agreement_takes_max_confidence() {
        let s = sensor(PostureLabel::CorrectPosture, 0.55);
        let c = camera(PostureLabel::CorrectPosture, 0.93);
        let decision = fuse(Some(&s), Some(&c), &weights()).unwrap();

        assert_eq!(decision.confidence, 0.93);
        assert_eq!(decision.reason, FusionReason::AgreementBoost);
        assert_eq!(decision.contributing_sources.len(), 2);

        // Agreement is never weight-blended, even with a lopsided weighting
        let skewed = FusionWeights::new(0.0, 1.0).unwrap();
        let s = sensor(PostureLabel::CorrectPosture, 0.97);
        let c = camera(PostureLabel::CorrectPosture, 0.10);
        let decision = fuse(Some(&s), Some(&c), &skewed).unwrap();
        assert_eq!(decision.confidence, 0.97);
    }

    #[test]
    fn test_tie_breaks_to_camera() {
        // 0.4 * 0.9 and 0.6 * 0.6 differ only by float rounding
        let s = sensor(PostureLabel::LeaningForward, 0.9);
        let c = camera(PostureLabel::CorrectPosture, 0.6);
        let decision = fuse(Some(&s), Some(&c), &weights()).unwrap();

        assert_eq!(decision.label, PostureLabel::CorrectPosture);
        assert_eq!(decision.reason, FusionReason::TieBreakCamera);
        assert_eq!(decision.confidence, 0.6);
    }

    #[test]
    fn test_sensor_override_reports_own_confidence() {
        let s = sensor(PostureLabel::LeaningForward, 0.9);
        let c = camera(PostureLabel::CorrectPosture, 0.5);
        let decision = fuse(Some(&s), Some(&c), &weights()).unwrap();

        assert_eq!(decision.label, PostureLabel::LeaningForward);
        assert_eq!(decision.reason, FusionReason::SensorOverride);
        assert_eq!(decision.confidence, 0.9);
        assert!((decision.sensor_score.unwrap() - 0.36).abs() < 1e-9);
        assert!((decision.camera_score.unwrap() - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_camera_override() {
        let s = sensor(PostureLabel::LeftLegCrossed, 0.6);
        let c = camera(PostureLabel::RightLegCrossed, 0.8);
        let decision = fuse(Some(&s), Some(&c), &weights()).unwrap();

        assert_eq!(decision.label, PostureLabel::RightLegCrossed);
        assert_eq!(decision.reason, FusionReason::CameraOverride);
        assert_eq!(decision.confidence, 0.8);
    }

    #[test]
    fn test_describe_conflict() {
        let s = sensor(PostureLabel::LeaningLeft, 0.9);
        let c = camera(PostureLabel::CorrectPosture, 0.5);
        let decision = fuse(Some(&s), Some(&c), &weights()).unwrap();

        assert_eq!(
            describe(&decision, Some(&s), Some(&c)),
            "Conflict: S=Leaning_left, C=Correct_posture -> Leaning_left (sensor_override)"
        );
    }

    #[test]
    fn test_describe_agreement_and_fallback() {
        let s = sensor(PostureLabel::CorrectPosture, 0.8);
        let c = camera(PostureLabel::CorrectPosture, 0.7);

        let agreed = fuse(Some(&s), Some(&c), &weights()).unwrap();
        assert_eq!(describe(&agreed, Some(&s), Some(&c)), "Both models agree");

        let alone = fuse(Some(&s), None, &weights()).unwrap();
        assert_eq!(describe(&alone, Some(&s), None), "Sensor only (0.80)");
    }
}
