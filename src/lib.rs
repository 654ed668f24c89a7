//! Posture Fusion - real-time fusion core for sitting-posture monitoring
//!
//! Two independent estimators classify the same sitter every tick: a cheap
//! pressure-sensor classifier and an expensive camera-pose classifier. The core
//! decides which of them to run, fuses their answers, debounces the result and
//! raises a warning when bad posture persists:
//! mode policy → estimators → fusion → stability → warning.
//!
//! ## Modules
//!
//! - **Mode policy** (`mode`): which estimators run this tick
//! - **Fusion engine** (`fusion`): one decision from zero, one or two estimates
//! - **Stability filter** (`stability`): rolling-window debounce of the visible label
//! - **Warning policy** (`warning`): persistence threshold for bad posture
//! - **Sessions** (`session`): tick/reset orchestration and cross-tick state

pub mod config;
pub mod error;
pub mod estimator;
pub mod fusion;
pub mod mode;
pub mod session;
pub mod stability;
pub mod stats;
pub mod types;
pub mod warning;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use config::{
    ConfigSource, FusionWeights, JsonFileConfig, ModeConfig, SessionSettings, SharedConfig,
    StaticConfig, SystemConfig,
};
pub use error::FusionError;
pub use estimator::{CameraEstimator, CameraFn, NoCamera, SensorEstimator};
pub use session::{FusionCore, MonitorSession, PendingTick, SharedSession};
pub use stats::SessionStats;
pub use types::{
    DetectionMode, Estimate, EstimateOutcome, EstimateSource, FusionDecision, FusionReason,
    OutcomeRecord, PostureLabel, SensorReading, StableState, TickOutput, WarningState,
};

/// Core version reported over the C ABI and by the CLI
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");
