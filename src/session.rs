//! Monitoring sessions
//!
//! This module provides the public API of the fusion core. A tick runs:
//! config poll → mode policy → estimators → fusion → stability → warning.
//!
//! - [`FusionCore`] holds all cross-tick state and knows nothing about
//!   estimators; it is driven with estimator outcomes directly.
//! - [`MonitorSession`] owns the estimators and config source and exposes
//!   `tick` / `reset`.
//! - [`SharedSession`] serializes ticks of one session across threads and
//!   runs the camera outside the lock, discarding superseded results.

use crate::config::{ConfigSource, ModeConfig, SessionSettings};
use crate::error::FusionError;
use crate::estimator::{CameraEstimator, SensorEstimator};
use crate::fusion::{describe, fuse};
use crate::mode::{camera_gate, sensor_plan, CameraGate};
use crate::stability::StabilityFilter;
use crate::stats::SessionStats;
use crate::types::{
    DetectionMode, Estimate, EstimateOutcome, EstimateSource, FusionDecision, SensorReading,
    StableState, TickOutput, WarningState,
};
use crate::warning;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A tick whose sensor half is done and which may still be waiting on the camera
#[derive(Debug)]
pub struct PendingTick {
    ticket: u64,
    started_at: DateTime<Utc>,
    config: ModeConfig,
    sensor: Option<Estimate>,
    gate: CameraGate,
}

impl PendingTick {
    /// Sequence number identifying this tick within its session
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the mode policy wants a camera estimate for this tick
    pub fn run_camera(&self) -> bool {
        self.gate.opens()
    }

    pub fn camera_gate(&self) -> CameraGate {
        self.gate
    }

    pub fn config(&self) -> &ModeConfig {
        &self.config
    }

    pub fn sensor_estimate(&self) -> Option<&Estimate> {
        self.sensor.as_ref()
    }
}

/// Cross-tick state of one monitoring session
#[derive(Debug)]
pub struct FusionCore {
    session_id: Uuid,
    settings: SessionSettings,
    filter: StabilityFilter,
    stable: StableState,
    warning: WarningState,
    stats: SessionStats,
    latest_ticket: u64,
    in_flight: Option<u64>,
    last_completed: u64,
    last_mode: Option<DetectionMode>,
}

impl FusionCore {
    /// Create a core, rejecting invalid settings
    pub fn new(settings: SessionSettings) -> Result<Self, FusionError> {
        settings.validate()?;
        Ok(Self {
            session_id: Uuid::new_v4(),
            settings,
            filter: StabilityFilter::new(settings.stability),
            stable: StableState::default(),
            warning: WarningState::default(),
            stats: SessionStats::default(),
            latest_ticket: 0,
            in_flight: None,
            last_completed: 0,
            last_mode: None,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn stable_state(&self) -> &StableState {
        &self.stable
    }

    pub fn warning_state(&self) -> &WarningState {
        &self.warning
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Ticket of the most recently begun tick
    pub fn latest_ticket(&self) -> u64 {
        self.latest_ticket
    }

    /// Start a tick.
    ///
    /// `sensor` is `None` when the mode does not run the sensor estimator.
    /// Any tick still waiting on its camera is superseded.
    pub fn begin(
        &mut self,
        config: ModeConfig,
        sensor: Option<EstimateOutcome>,
        now: DateTime<Utc>,
    ) -> PendingTick {
        if let Some(abandoned) = self.in_flight.take() {
            self.stats.superseded_ticks += 1;
            warn!(ticket = abandoned, "tick superseded before its camera estimate arrived");
        }

        if self.last_mode != Some(config.mode) {
            if let Some(previous) = self.last_mode {
                info!(from = %previous, to = %config.mode, "detection mode switched");
            }
            self.last_mode = Some(config.mode);
        }

        self.latest_ticket += 1;
        let ticket = self.latest_ticket;
        self.in_flight = Some(ticket);

        let sensor = self.accept(sensor, EstimateSource::Sensor);
        let gate = camera_gate(&config, &self.stable, sensor.as_ref());

        debug!(
            ticket,
            mode = %config.mode,
            sensor_confidence = sensor.as_ref().map(|s| s.confidence),
            gate = ?gate,
            "tick planned"
        );

        PendingTick {
            ticket,
            started_at: now,
            config,
            sensor,
            gate,
        }
    }

    /// Finish a tick with the camera outcome (`None` if the camera was not run).
    ///
    /// A stale ticket leaves all state untouched and fails with
    /// [`FusionError::SupersededTick`].
    pub fn complete(
        &mut self,
        pending: PendingTick,
        camera: Option<EstimateOutcome>,
        now: DateTime<Utc>,
    ) -> Result<TickOutput, FusionError> {
        if self.in_flight != Some(pending.ticket) {
            debug!(ticket = pending.ticket, latest = self.latest_ticket, "discarding stale tick");
            return Err(FusionError::SupersededTick {
                ticket: pending.ticket,
                latest: self.latest_ticket,
            });
        }
        self.in_flight = None;

        let camera_invoked = pending.run_camera() && camera.is_some();
        let camera = if pending.run_camera() {
            self.accept(camera, EstimateSource::Camera)
        } else {
            None
        };
        if camera_invoked {
            self.stats.camera_invocations += 1;
        } else if pending.config.mode == DetectionMode::AutoSmart && !pending.run_camera() {
            self.stats.camera_skipped += 1;
        }

        let config = pending.config;
        let decision = match fuse(pending.sensor.as_ref(), camera.as_ref(), &config.fusion_weights) {
            Ok(decision) => Some(decision),
            Err(FusionError::NoEstimateAvailable) => None,
            Err(e) => return Err(e),
        };

        let previous_label = self.stable.label;
        let mut stable = self.filter.update(&self.stable, decision.as_ref(), now);
        stable.mode = config.mode;

        let policy = &self.settings.warning;
        let (is_warning, warning_state) = match decision {
            Some(_) => warning::evaluate(&stable, &self.warning, now, policy),
            None => warning::refresh(&stable, &self.warning, now, policy),
        };
        stable.warning = is_warning;

        self.stats.ticks += 1;
        match &decision {
            Some(d) => self.stats.record_decision(d.label, d.reason),
            None => {
                self.stats.gap_ticks += 1;
                debug!(ticket = pending.ticket, "no estimate available, keeping previous state");
            }
        }

        if stable.label != previous_label {
            self.stats.label_changes += 1;
            info!(
                from = ?previous_label.map(|l| l.as_str()),
                to = ?stable.label.map(|l| l.as_str()),
                confidence = stable.confidence,
                "posture changed"
            );
        }
        if is_warning && !self.warning.is_warning {
            self.stats.warnings_raised += 1;
            warn!(
                posture = ?stable.label.map(|l| l.as_str()),
                consecutive_bad_ticks = warning_state.consecutive_bad_ticks,
                "bad posture warning raised"
            );
        }

        self.stable = stable;
        self.warning = warning_state;
        self.last_completed = pending.ticket;

        Ok(TickOutput {
            session_id: self.session_id,
            sequence: pending.ticket,
            timestamp: now,
            label: self.stable.label,
            confidence: self.stable.confidence,
            mode: config.mode,
            warning: self.stable.warning,
            fusion_reason: decision.as_ref().map(|d| d.reason),
            reason_detail: reason_detail(
                decision.as_ref(),
                pending.gate,
                pending.sensor.as_ref(),
                camera.as_ref(),
            ),
            contributing_sources: decision
                .as_ref()
                .map(|d| d.contributing_sources.clone())
                .unwrap_or_default(),
            sensor_confidence: pending.sensor.as_ref().map(|s| s.confidence),
            camera_confidence: camera.as_ref().map(|c| c.confidence),
            camera_invoked,
            stale: decision.is_none(),
        })
    }

    /// The last completed state, reported without a new decision
    pub fn snapshot(&self, now: DateTime<Utc>) -> TickOutput {
        TickOutput {
            session_id: self.session_id,
            sequence: self.last_completed,
            timestamp: now,
            label: self.stable.label,
            confidence: self.stable.confidence,
            mode: self.stable.mode,
            warning: self.stable.warning,
            fusion_reason: None,
            reason_detail: "Snapshot of last completed tick".to_string(),
            contributing_sources: BTreeSet::new(),
            sensor_confidence: None,
            camera_confidence: None,
            camera_invoked: false,
            stale: true,
        }
    }

    /// Clear stable state, warning state, history and statistics.
    ///
    /// A tick in flight is invalidated; its completion will be discarded.
    pub fn reset(&mut self) {
        info!(session_id = %self.session_id, "session reset");
        self.filter.clear();
        self.stable = StableState::new(self.stable.mode);
        self.warning = WarningState::default();
        self.stats.clear();
        self.in_flight = None;
        self.latest_ticket += 1;
        self.last_completed = 0;
    }

    /// Turn an estimator outcome into a usable estimate, logging why not
    fn accept(
        &mut self,
        outcome: Option<EstimateOutcome>,
        source: EstimateSource,
    ) -> Option<Estimate> {
        let outcome = outcome?;
        if let Some(err) = outcome.failure(source) {
            match outcome {
                EstimateOutcome::TimedOut => self.stats.estimator_timeouts += 1,
                _ => self.stats.estimator_failures += 1,
            }
            warn!(error = %err, "treating estimator as absent");
            return None;
        }

        let estimate = outcome.into_estimate()?;
        if !estimate.is_valid() || estimate.source != source {
            self.stats.estimator_failures += 1;
            warn!(
                expected = %source,
                actual = %estimate.source,
                confidence = estimate.confidence,
                "discarding malformed estimate"
            );
            return None;
        }
        Some(estimate)
    }
}

fn reason_detail(
    decision: Option<&FusionDecision>,
    gate: CameraGate,
    sensor: Option<&Estimate>,
    camera: Option<&Estimate>,
) -> String {
    let Some(decision) = decision else {
        return "No estimate available, keeping previous state".to_string();
    };
    let described = describe(decision, sensor, camera);

    match (gate, sensor) {
        (CameraGate::LowConfidence, Some(s)) => {
            format!("Sensor low ({:.2}), camera activated; {}", s.confidence, described)
        }
        (CameraGate::NeedsConfirmation, Some(s)) => {
            format!("{} needs visual confirmation, camera activated; {}", s.label, described)
        }
        (CameraGate::SensorMissing, _) => {
            format!("Sensor unavailable, camera activated; {}", described)
        }
        (CameraGate::SensorConfident, Some(s)) => format!("Sensor confident ({:.2})", s.confidence),
        _ => described,
    }
}

/// Ask the camera for an estimate if the pending tick wants one and a frame exists
pub fn invoke_camera<C: CameraEstimator + ?Sized>(
    camera: &C,
    pending: &PendingTick,
    frame: Option<&C::Frame>,
    now: DateTime<Utc>,
) -> Option<EstimateOutcome> {
    if !pending.run_camera() {
        return None;
    }
    match frame {
        Some(frame) => Some(camera.estimate(frame, now)),
        None => {
            debug!(ticket = pending.ticket(), "camera requested but no frame available");
            None
        }
    }
}

/// A monitoring session owning its estimators and config source
pub struct MonitorSession<S, C, K> {
    sensor: S,
    camera: Arc<C>,
    config_source: K,
    last_config: ModeConfig,
    core: FusionCore,
}

impl<S, C, K> MonitorSession<S, C, K>
where
    S: SensorEstimator,
    C: CameraEstimator,
    K: ConfigSource,
{
    /// Create a session with default settings
    pub fn new(sensor: S, camera: C, config_source: K) -> Result<Self, FusionError> {
        Self::with_settings(sensor, camera, config_source, SessionSettings::default())
    }

    /// Create a session; the config source must currently yield a valid config
    pub fn with_settings(
        sensor: S,
        camera: C,
        config_source: K,
        settings: SessionSettings,
    ) -> Result<Self, FusionError> {
        let config = config_source.current()?;
        config.validate()?;
        let mut core = FusionCore::new(settings)?;
        core.stable.mode = config.mode;

        info!(
            session_id = %core.session_id(),
            mode = %config.mode,
            window = settings.stability.window,
            "monitoring session created"
        );

        Ok(Self {
            sensor,
            camera: Arc::new(camera),
            config_source,
            last_config: config,
            core,
        })
    }

    pub fn core(&self) -> &FusionCore {
        &self.core
    }

    pub fn stable_state(&self) -> &StableState {
        self.core.stable_state()
    }

    pub fn warning_state(&self) -> &WarningState {
        self.core.warning_state()
    }

    pub fn stats(&self) -> &SessionStats {
        self.core.stats()
    }

    /// Shared handle to the camera estimator, for running it off-thread
    pub fn camera(&self) -> Arc<C> {
        Arc::clone(&self.camera)
    }

    /// Run one full tick
    #[instrument(skip_all, fields(session_id = %self.core.session_id()))]
    pub fn tick(
        &mut self,
        reading: &SensorReading,
        frame: Option<&C::Frame>,
        now: DateTime<Utc>,
    ) -> TickOutput {
        let pending = self.begin_tick(reading, now);
        let camera = invoke_camera(self.camera.as_ref(), &pending, frame, now);
        match self.complete_tick(pending, camera, now) {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "tick could not complete, reporting last state");
                self.core.snapshot(now)
            }
        }
    }

    /// Poll config, run the sensor estimator and evaluate the camera gate
    pub fn begin_tick(&mut self, reading: &SensorReading, now: DateTime<Utc>) -> PendingTick {
        let config = self.poll_config();
        let sensor = sensor_plan(config.mode).then(|| self.sensor.estimate(reading, now));
        self.core.begin(config, sensor, now)
    }

    pub fn complete_tick(
        &mut self,
        pending: PendingTick,
        camera: Option<EstimateOutcome>,
        now: DateTime<Utc>,
    ) -> Result<TickOutput, FusionError> {
        self.core.complete(pending, camera, now)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> TickOutput {
        self.core.snapshot(now)
    }

    pub fn reset(&mut self) {
        self.core.reset();
    }

    /// Current config, or the last good one if the source fails mid-session
    fn poll_config(&mut self) -> ModeConfig {
        match self.config_source.current().and_then(|c| c.validate().map(|_| c)) {
            Ok(config) => {
                if config != self.last_config {
                    info!(
                        mode = %config.mode,
                        auto_threshold = config.auto_threshold,
                        sensor_weight = config.fusion_weights.sensor,
                        camera_weight = config.fusion_weights.camera,
                        "configuration reloaded"
                    );
                    self.last_config = config;
                }
                config
            }
            Err(e) => {
                warn!(error = %e, "config source failed, keeping last good config");
                self.last_config
            }
        }
    }
}

/// A session shared between threads; at most one tick is in flight
pub struct SharedSession<S, C, K> {
    inner: Arc<Mutex<MonitorSession<S, C, K>>>,
    camera: Arc<C>,
}

impl<S, C, K> Clone for SharedSession<S, C, K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            camera: Arc::clone(&self.camera),
        }
    }
}

impl<S, C, K> SharedSession<S, C, K>
where
    S: SensorEstimator,
    C: CameraEstimator,
    K: ConfigSource,
{
    pub fn new(session: MonitorSession<S, C, K>) -> Self {
        let camera = session.camera();
        Self {
            inner: Arc::new(Mutex::new(session)),
            camera,
        }
    }

    /// Run one tick under the lock. Only a camera call releases it.
    ///
    /// Fails with [`FusionError::SupersededTick`] if another tick began while
    /// this one waited on the camera.
    pub fn tick(
        &self,
        reading: &SensorReading,
        frame: Option<&C::Frame>,
        now: DateTime<Utc>,
    ) -> Result<TickOutput, FusionError> {
        let mut session = self.lock();
        let pending = session.begin_tick(reading, now);
        let frame = match frame {
            Some(frame) if pending.run_camera() => frame,
            _ => {
                let camera = invoke_camera(self.camera.as_ref(), &pending, None, now);
                return session.complete_tick(pending, camera, now);
            }
        };
        drop(session);

        let camera = invoke_camera(self.camera.as_ref(), &pending, Some(frame), now);
        self.lock().complete_tick(pending, camera, now)
    }

    pub fn begin_tick(&self, reading: &SensorReading, now: DateTime<Utc>) -> PendingTick {
        self.lock().begin_tick(reading, now)
    }

    pub fn complete_tick(
        &self,
        pending: PendingTick,
        camera: Option<EstimateOutcome>,
        now: DateTime<Utc>,
    ) -> Result<TickOutput, FusionError> {
        self.lock().complete_tick(pending, camera, now)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> TickOutput {
        self.lock().snapshot(now)
    }

    pub fn stats(&self) -> SessionStats {
        self.lock().stats().clone()
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    fn lock(&self) -> MutexGuard<'_, MonitorSession<S, C, K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
