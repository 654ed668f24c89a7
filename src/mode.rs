//! Mode policy
//!
//! Decides, per tick, which estimators run. The decision is a pure function of
//! the mode config, the previous stable state and (for AutoSmart) the sensor
//! estimate already obtained this tick, so the camera-activation gate can be
//! tested on its own.

use crate::config::ModeConfig;
use crate::types::{DetectionMode, Estimate, StableState};
use serde::{Deserialize, Serialize};

/// Which estimators a tick should invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePlan {
    pub run_sensor: bool,
    pub run_camera: bool,
}

/// Why AutoSmart did or did not ask the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraGate {
    /// The mode never runs the camera
    Disabled,
    /// The mode always runs the camera
    Always,
    SensorMissing,
    LowConfidence,
    NeedsConfirmation,
    SensorConfident,
}

impl CameraGate {
    pub fn opens(&self) -> bool {
        matches!(
            self,
            CameraGate::Always
                | CameraGate::SensorMissing
                | CameraGate::LowConfidence
                | CameraGate::NeedsConfirmation
        )
    }
}

/// Whether the sensor estimator runs in `mode`; known before any estimator is called
pub fn sensor_plan(mode: DetectionMode) -> bool {
    match mode {
        DetectionMode::SensorOnly | DetectionMode::AutoSmart | DetectionMode::Fusion => true,
        DetectionMode::CameraOnly => false,
    }
}

/// Evaluate the camera-activation gate for this tick
pub fn camera_gate(
    config: &ModeConfig,
    previous: &StableState,
    sensor: Option<&Estimate>,
) -> CameraGate {
    match config.mode {
        DetectionMode::SensorOnly => CameraGate::Disabled,
        DetectionMode::CameraOnly | DetectionMode::Fusion => CameraGate::Always,
        DetectionMode::AutoSmart => match sensor {
            None => CameraGate::SensorMissing,
            Some(estimate) if estimate.confidence < config.auto_threshold => {
                CameraGate::LowConfidence
            }
            Some(estimate)
                if estimate.label.needs_visual_confirmation() && !previous.is_correct() =>
            {
                CameraGate::NeedsConfirmation
            }
            Some(_) => CameraGate::SensorConfident,
        },
    }
}

/// Decide which estimators run this tick.
///
/// For AutoSmart the sensor runs first and its estimate feeds the camera gate;
/// for the other modes `sensor` is ignored.
pub fn decide_sources(
    config: &ModeConfig,
    previous: &StableState,
    sensor: Option<&Estimate>,
) -> SourcePlan {
    SourcePlan {
        run_sensor: sensor_plan(config.mode),
        run_camera: camera_gate(config, previous, sensor).opens(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PostureLabel;
    use chrono::{TimeZone, Utc};

    fn sensor(label: PostureLabel, confidence: f64) -> Estimate {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        Estimate::sensor(label, confidence, now).unwrap()
    }

    fn stable(label: Option<PostureLabel>) -> StableState {
        StableState {
            label,
            confidence: 0.9,
            ..StableState::default()
        }
    }

    #[test]
    fn test_sensor_only_never_runs_camera() {
        let config = ModeConfig::with_mode(DetectionMode::SensorOnly);
        let low = sensor(PostureLabel::LeaningLeft, 0.1);

        let plan = decide_sources(&config, &stable(None), Some(&low));
        assert_eq!(
            plan,
            SourcePlan {
                run_sensor: true,
                run_camera: false
            }
        );
    }

    #[test]
    fn test_camera_only_skips_sensor() {
        let config = ModeConfig::with_mode(DetectionMode::CameraOnly);
        let plan = decide_sources(&config, &stable(None), None);
        assert_eq!(
            plan,
            SourcePlan {
                run_sensor: false,
                run_camera: true
            }
        );
    }

    #[test]
    fn test_fusion_runs_both() {
        let config = ModeConfig::with_mode(DetectionMode::Fusion);
        let confident = sensor(PostureLabel::CorrectPosture, 0.99);

        let plan = decide_sources(
            &config,
            &stable(Some(PostureLabel::CorrectPosture)),
            Some(&confident),
        );
        assert!(plan.run_sensor && plan.run_camera);
    }

    #[test]
    fn test_auto_skips_camera_on_confident_stable_correct() {
        let config = ModeConfig::with_mode(DetectionMode::AutoSmart);
        let previous = stable(Some(PostureLabel::CorrectPosture));

        for label in PostureLabel::ALL {
            let estimate = sensor(label, 0.70);
            let plan = decide_sources(&config, &previous, Some(&estimate));
            assert!(plan.run_sensor);
            assert!(!plan.run_camera, "camera ran for confident {label}");
        }
    }

    #[test]
    fn test_auto_runs_camera_on_low_confidence_regardless_of_previous() {
        let config = ModeConfig::with_mode(DetectionMode::AutoSmart);
        let low = sensor(PostureLabel::CorrectPosture, 0.69);

        for previous in [
            stable(None),
            stable(Some(PostureLabel::CorrectPosture)),
            stable(Some(PostureLabel::LeaningRight)),
        ] {
            assert_eq!(
                camera_gate(&config, &previous, Some(&low)),
                CameraGate::LowConfidence
            );
        }
    }

    #[test]
    fn test_auto_confirms_ambiguous_label_visually() {
        let config = ModeConfig::with_mode(DetectionMode::AutoSmart);
        let previous = stable(Some(PostureLabel::LeaningLeft));

        let hunched = sensor(PostureLabel::UpperBodyHunched, 0.95);
        assert_eq!(
            camera_gate(&config, &previous, Some(&hunched)),
            CameraGate::NeedsConfirmation
        );

        let crossed = sensor(PostureLabel::LeftLegCrossed, 0.95);
        assert_eq!(
            camera_gate(&config, &previous, Some(&crossed)),
            CameraGate::SensorConfident
        );
    }

    #[test]
    fn test_auto_runs_camera_without_sensor() {
        let config = ModeConfig::with_mode(DetectionMode::AutoSmart);
        let plan = decide_sources(&config, &stable(None), None);
        assert!(plan.run_camera);
    }

    #[test]
    fn test_gate_respects_custom_threshold() {
        let config = ModeConfig {
            auto_threshold: 0.9,
            ..ModeConfig::with_mode(DetectionMode::AutoSmart)
        };
        let previous = stable(Some(PostureLabel::CorrectPosture));

        let estimate = sensor(PostureLabel::CorrectPosture, 0.85);
        assert!(decide_sources(&config, &previous, Some(&estimate)).run_camera);
    }
}
