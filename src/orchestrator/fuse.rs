//! Sliding-window retry fuse.
//!
//! Each `(issue, agent)` pair gets a budget of retry attempts inside a
//! soft window; exceeding it trips the fuse and blocks retries until the
//! window elapses. A second trip inside the hard window is a permanent
//! hard stop that requires a manual reset. Fuse state is persisted with
//! the launch registry so restarts do not forget trips.

use serde::{Deserialize, Serialize};

use crate::config::RetryFuseConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryFuseState {
    pub agent: String,
    /// Epoch seconds of the current soft window's start.
    pub window_start: f64,
    pub attempts: u32,
    pub tripped: bool,
    pub alerted: bool,
    pub hard_tripped: bool,
    #[serde(default)]
    pub trip_times: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseDecision {
    Allowed,
    /// Soft trip: blocked until the soft window elapses.
    SoftTripped,
    /// Hard stop: blocked until manually reset.
    HardTripped,
}

impl FuseDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, FuseDecision::Allowed)
    }
}

/// Record a retry attempt for `agent` at `now` and decide whether it may
/// proceed.
pub fn register_attempt(
    state: &mut RetryFuseState,
    agent: &str,
    now: f64,
    config: &RetryFuseConfig,
) -> FuseDecision {
    let soft_window = config.soft_window.as_secs_f64();
    let hard_window = config.hard_window.as_secs_f64();

    state.trip_times.retain(|t| now - *t <= hard_window);

    if state.hard_tripped {
        return FuseDecision::HardTripped;
    }

    // A different agent starts a fresh soft window; trip history stays.
    if state.agent != agent {
        state.agent = agent.to_string();
        state.window_start = now;
        state.attempts = 0;
        state.tripped = false;
        state.alerted = false;
    }

    if now - state.window_start > soft_window {
        state.window_start = now;
        state.attempts = 0;
        state.tripped = false;
        state.alerted = false;
    } else if state.tripped {
        return FuseDecision::SoftTripped;
    }

    state.attempts += 1;
    if state.attempts > config.max_attempts {
        state.tripped = true;
        let prior_trips = state.trip_times.len();
        state.trip_times.push(now);
        if prior_trips >= 1 {
            state.hard_tripped = true;
            return FuseDecision::HardTripped;
        }
        return FuseDecision::SoftTripped;
    }

    FuseDecision::Allowed
}

/// Structured fuse view for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryFuseStatus {
    pub exists: bool,
    pub agent: String,
    pub attempts: u32,
    pub tripped: bool,
    pub hard_tripped: bool,
    pub trip_count_in_hard_window: usize,
    pub window_remaining_seconds: f64,
}

pub fn fuse_status(
    state: Option<&RetryFuseState>,
    now: f64,
    config: &RetryFuseConfig,
) -> RetryFuseStatus {
    let Some(state) = state else {
        return RetryFuseStatus {
            exists: false,
            agent: String::new(),
            attempts: 0,
            tripped: false,
            hard_tripped: false,
            trip_count_in_hard_window: 0,
            window_remaining_seconds: 0.0,
        };
    };

    let hard_window = config.hard_window.as_secs_f64();
    let soft_window = config.soft_window.as_secs_f64();
    let trips_in_window = state
        .trip_times
        .iter()
        .filter(|t| now - **t <= hard_window)
        .count();
    let remaining = (soft_window - (now - state.window_start)).max(0.0);

    RetryFuseStatus {
        exists: true,
        agent: state.agent.clone(),
        attempts: state.attempts,
        tripped: state.tripped,
        hard_tripped: state.hard_tripped,
        trip_count_in_hard_window: trips_in_window,
        window_remaining_seconds: remaining,
    }
}
