//! Warning policy
//!
//! Raises the warning flag once a bad stable posture has lasted either
//! `bad_threshold_ticks` consecutive ticks or longer than `window_seconds`,
//! whichever comes first. Returning to correct posture clears it at once.

use crate::config::WarningPolicyConfig;
use crate::types::{StableState, WarningState};
use chrono::{DateTime, Duration, Utc};

/// Evaluate a tick that produced a fresh decision
pub fn evaluate(
    stable: &StableState,
    state: &WarningState,
    now: DateTime<Utc>,
    policy: &WarningPolicyConfig,
) -> (bool, WarningState) {
    let Some(label) = stable.label else {
        return (state.is_warning, state.clone());
    };

    if label.is_correct() {
        return (false, WarningState::default());
    }

    let mut next = expire_idle_streak(state, now, policy);
    next.consecutive_bad_ticks = next.consecutive_bad_ticks.saturating_add(1);
    let window_start = *next.window_start.get_or_insert(now);
    next.last_bad_at = Some(now);

    next.is_warning = next.consecutive_bad_ticks >= policy.bad_threshold_ticks
        || exceeds_window(window_start, now, policy);

    (next.is_warning, next)
}

/// Evaluate a gap tick: no counting, only the elapsed-time trigger may fire
pub fn refresh(
    stable: &StableState,
    state: &WarningState,
    now: DateTime<Utc>,
    policy: &WarningPolicyConfig,
) -> (bool, WarningState) {
    if !stable.label.map_or(false, |label| label.is_bad()) {
        return (state.is_warning, state.clone());
    }

    let mut next = state.clone();
    if let Some(window_start) = next.window_start {
        // The visible label is still bad, so the streak stays alive
        next.last_bad_at = Some(now);
        if exceeds_window(window_start, now, policy) {
            next.is_warning = true;
        }
    }

    (next.is_warning, next)
}

/// A streak with no bad tick for longer than the window restarts from zero.
/// An active warning never expires this way; only correct posture clears it.
fn expire_idle_streak(
    state: &WarningState,
    now: DateTime<Utc>,
    policy: &WarningPolicyConfig,
) -> WarningState {
    match state.last_bad_at {
        Some(last) if !state.is_warning && now - last > window(policy) => WarningState::default(),
        _ => state.clone(),
    }
}

fn exceeds_window(window_start: DateTime<Utc>, now: DateTime<Utc>, policy: &WarningPolicyConfig) -> bool {
    now - window_start > window(policy)
}

fn window(policy: &WarningPolicyConfig) -> Duration {
    i64::try_from(policy.window_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}
