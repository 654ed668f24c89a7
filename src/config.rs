//! Configuration for the fusion core
//!
//! `ModeConfig` is owned by an external configuration collaborator and polled
//! once per tick through a [`ConfigSource`]. `SessionSettings` hold the
//! stability and warning tunables fixed for the lifetime of a session.
//!
//! Every constructor that accepts outside input validates it and fails with
//! [`FusionError::InvalidConfig`]; weights are never renormalized.

use crate::error::FusionError;
use crate::types::{DetectionMode, EstimateSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Default confidence threshold below which AutoSmart asks the camera
pub const DEFAULT_AUTO_THRESHOLD: f64 = 0.70;

/// Default trust weight of the sensor estimator
pub const DEFAULT_SENSOR_WEIGHT: f64 = 0.4;

/// Default trust weight of the camera estimator
pub const DEFAULT_CAMERA_WEIGHT: f64 = 0.6;

/// Default stability window (ticks)
pub const DEFAULT_STABILITY_WINDOW: usize = 3;

/// Default number of consecutive bad ticks before warning
pub const DEFAULT_BAD_THRESHOLD_TICKS: u32 = 3;

/// Default bad-posture duration before warning (5 minutes)
pub const DEFAULT_WARNING_WINDOW_SECONDS: u64 = 300;

/// Allowed deviation of the weight sum from 1.0
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Trust weights used to arbitrate disagreements
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub sensor: f64,
    pub camera: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            sensor: DEFAULT_SENSOR_WEIGHT,
            camera: DEFAULT_CAMERA_WEIGHT,
        }
    }
}

impl FusionWeights {
    /// Build weights, rejecting pairs that do not sum to 1.0
    pub fn new(sensor: f64, camera: f64) -> Result<Self, FusionError> {
        let weights = Self { sensor, camera };
        weights.validate()?;
        Ok(weights)
    }

    pub fn for_source(&self, source: EstimateSource) -> f64 {
        match source {
            EstimateSource::Sensor => self.sensor,
            EstimateSource::Camera => self.camera,
        }
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        for (name, weight) in [("sensor", self.sensor), ("camera", self.camera)] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(FusionError::InvalidConfig(format!(
                    "{name} weight must be a non-negative number, got {weight}"
                )));
            }
        }
        let sum = self.sensor + self.camera;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(FusionError::InvalidConfig(format!(
                "fusion weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

/// Operating mode and its parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub mode: DetectionMode,
    #[serde(default = "default_auto_threshold")]
    pub auto_threshold: f64,
    #[serde(default)]
    pub fusion_weights: FusionWeights,
}

fn default_auto_threshold() -> f64 {
    DEFAULT_AUTO_THRESHOLD
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::AutoSmart,
            auto_threshold: DEFAULT_AUTO_THRESHOLD,
            fusion_weights: FusionWeights::default(),
        }
    }
}

impl ModeConfig {
    /// Default parameters with the given mode
    pub fn with_mode(mode: DetectionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        if !(0.0..=1.0).contains(&self.auto_threshold) {
            return Err(FusionError::InvalidConfig(format!(
                "auto_threshold must be within [0, 1], got {}",
                self.auto_threshold
            )));
        }
        self.fusion_weights.validate()
    }

    /// Parse and validate a mode config from JSON
    pub fn from_json(json: &str) -> Result<Self, FusionError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FusionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, FusionError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Stability filter tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Number of most recent ticks voting on the visible label
    pub window: usize,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_STABILITY_WINDOW,
        }
    }
}

impl StabilityConfig {
    /// Votes needed to change the visible label: ceil((N + 1) / 2)
    pub fn majority(&self) -> usize {
        (self.window + 2) / 2
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        if self.window == 0 {
            return Err(FusionError::InvalidConfig(
                "stability window must hold at least one tick".to_string(),
            ));
        }
        Ok(())
    }
}

/// Warning policy tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningPolicyConfig {
    pub bad_threshold_ticks: u32,
    pub window_seconds: u64,
}

impl Default for WarningPolicyConfig {
    fn default() -> Self {
        Self {
            bad_threshold_ticks: DEFAULT_BAD_THRESHOLD_TICKS,
            window_seconds: DEFAULT_WARNING_WINDOW_SECONDS,
        }
    }
}

impl WarningPolicyConfig {
    pub fn validate(&self) -> Result<(), FusionError> {
        if self.bad_threshold_ticks == 0 {
            return Err(FusionError::InvalidConfig(
                "bad_threshold_ticks must be at least 1".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(FusionError::InvalidConfig(
                "window_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-session settings fixed at session creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub warning: WarningPolicyConfig,
}

impl SessionSettings {
    pub fn validate(&self) -> Result<(), FusionError> {
        self.stability.validate()?;
        self.warning.validate()
    }
}

/// On-disk system configuration: the mode config plus optional session settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(flatten)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub session: SessionSettings,
}

impl SystemConfig {
    pub fn validate(&self) -> Result<(), FusionError> {
        self.mode.validate()?;
        self.session.validate()
    }

    pub fn from_json(json: &str) -> Result<Self, FusionError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FusionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, FusionError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, FusionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Supplies the current mode config; polled once per tick
pub trait ConfigSource {
    fn current(&self) -> Result<ModeConfig, FusionError>;
}

/// A fixed, pre-validated config
#[derive(Debug, Clone, Copy)]
pub struct StaticConfig(ModeConfig);

impl StaticConfig {
    pub fn new(config: ModeConfig) -> Result<Self, FusionError> {
        config.validate()?;
        Ok(Self(config))
    }
}

impl ConfigSource for StaticConfig {
    fn current(&self) -> Result<ModeConfig, FusionError> {
        Ok(self.0)
    }
}

/// In-process config shared with an API layer that may update it between ticks
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<ModeConfig>>,
}

impl SharedConfig {
    pub fn new(config: ModeConfig) -> Result<Self, FusionError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
        })
    }

    /// Replace the config; invalid configs are rejected and the old one kept
    pub fn update(&self, config: ModeConfig) -> Result<(), FusionError> {
        config.validate()?;
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = config;
        Ok(())
    }

    pub fn set_mode(&self, mode: DetectionMode) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.mode = mode;
    }
}

impl ConfigSource for SharedConfig {
    fn current(&self) -> Result<ModeConfig, FusionError> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(*guard)
    }
}

/// JSON file re-read on every poll, so edits apply on the next tick
#[derive(Debug, Clone)]
pub struct JsonFileConfig {
    path: PathBuf,
}

impl JsonFileConfig {
    /// Open a config file, failing fast if its current contents are invalid
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FusionError> {
        let source = Self { path: path.into() };
        source.current()?;
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for JsonFileConfig {
    fn current(&self) -> Result<ModeConfig, FusionError> {
        SystemConfig::load(&self.path).map(|config| config.mode)
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for Arc<T> {
    fn current(&self) -> Result<ModeConfig, FusionError> {
        (**self).current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_deployment() {
        let config = ModeConfig::default();
        assert_eq!(config.mode, DetectionMode::AutoSmart);
        assert!((config.auto_threshold - 0.70).abs() < 1e-12);
        assert_eq!(config.fusion_weights, FusionWeights::new(0.4, 0.6).unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(FusionWeights::new(0.5, 0.5).is_ok());
        assert!(FusionWeights::new(0.3, 0.7).is_ok());

        let err = FusionWeights::new(0.5, 0.6).unwrap_err();
        assert!(matches!(err, FusionError::InvalidConfig(_)));

        assert!(FusionWeights::new(-0.2, 1.2).is_err());
        assert!(FusionWeights::new(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_mode_config_from_json() {
        let config = ModeConfig::from_json(
            r#"{"mode": "fusion", "auto_threshold": 0.8, "fusion_weights": {"sensor": 0.3, "camera": 0.7}}"#,
        )
        .unwrap();

        assert_eq!(config.mode, DetectionMode::Fusion);
        assert!((config.auto_threshold - 0.8).abs() < 1e-12);
        assert!((config.fusion_weights.camera - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_mode_config_defaults_missing_fields() {
        let config = ModeConfig::from_json(r#"{"mode": "auto_smart"}"#).unwrap();
        assert_eq!(config, ModeConfig::with_mode(DetectionMode::AutoSmart));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = ModeConfig::from_json(r#"{"mode": "turbo"}"#).unwrap_err();
        assert!(matches!(err, FusionError::InvalidConfig(_)));
    }

    #[test]
    fn test_unbalanced_weights_rejected_from_json() {
        let err = ModeConfig::from_json(
            r#"{"mode": "fusion", "fusion_weights": {"sensor": 0.4, "camera": 0.4}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let config = ModeConfig {
            auto_threshold: 1.5,
            ..ModeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_majority_threshold() {
        assert_eq!(StabilityConfig { window: 1 }.majority(), 1);
        assert_eq!(StabilityConfig { window: 3 }.majority(), 2);
        assert_eq!(StabilityConfig { window: 4 }.majority(), 3);
        assert_eq!(StabilityConfig { window: 5 }.majority(), 3);
    }

    #[test]
    fn test_session_settings_validation() {
        assert!(SessionSettings::default().validate().is_ok());

        let zero_window = SessionSettings {
            stability: StabilityConfig { window: 0 },
            ..SessionSettings::default()
        };
        assert!(zero_window.validate().is_err());

        let zero_threshold = SessionSettings {
            warning: WarningPolicyConfig {
                bad_threshold_ticks: 0,
                window_seconds: 300,
            },
            ..SessionSettings::default()
        };
        assert!(zero_threshold.validate().is_err());
    }

    #[test]
    fn test_system_config_round_trip() {
        let json = r#"{
            "mode": "camera_only",
            "auto_threshold": 0.65,
            "fusion_weights": {"sensor": 0.5, "camera": 0.5},
            "session": {"stability": {"window": 5}, "warning": {"bad_threshold_ticks": 4, "window_seconds": 120}}
        }"#;

        let config = SystemConfig::from_json(json).unwrap();
        assert_eq!(config.mode.mode, DetectionMode::CameraOnly);
        assert_eq!(config.session.stability.window, 5);
        assert_eq!(config.session.warning.bad_threshold_ticks, 4);

        let reparsed = SystemConfig::from_json(&config.to_json_pretty().unwrap()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_shared_config_rejects_invalid_update() {
        let shared = SharedConfig::new(ModeConfig::default()).unwrap();

        let bad = ModeConfig {
            fusion_weights: FusionWeights {
                sensor: 0.9,
                camera: 0.9,
            },
            ..ModeConfig::default()
        };
        assert!(shared.update(bad).is_err());
        assert_eq!(shared.current().unwrap(), ModeConfig::default());

        shared.set_mode(DetectionMode::Fusion);
        assert_eq!(shared.current().unwrap().mode, DetectionMode::Fusion);
    }

    #[test]
    fn test_json_file_config_hot_reload() {
        let path = std::env::temp_dir().join(format!(
            "posture-fusion-config-{}.json",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, r#"{"mode": "sensor_only"}"#).unwrap();

        let source = JsonFileConfig::open(&path).unwrap();
        assert_eq!(source.current().unwrap().mode, DetectionMode::SensorOnly);

        std::fs::write(&path, r#"{"mode": "fusion"}"#).unwrap();
        assert_eq!(source.current().unwrap().mode, DetectionMode::Fusion);

        std::fs::write(&path, r#"{"mode": "fusion", "fusion_weights": {"sensor": 1.0, "camera": 1.0}}"#)
            .unwrap();
        assert!(source.current().is_err());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_json_file_config_missing_file() {
        let err = JsonFileConfig::open("/nonexistent/posture/system_config.json").unwrap_err();
        assert!(matches!(err, FusionError::Io(_)));
    }
}
