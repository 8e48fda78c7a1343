//! Observed (read-back) plant state and command-driven transition state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default staleness threshold: `now - last_success > 3s` marks the
/// observed state stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::seconds(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    Ok,
    ConnectFailed,
    ReadError,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedError {
    pub timestamp: DateTime<Utc>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    pub enable_state: Option<u16>,
    pub p_battery_kw: Option<f64>,
    pub q_battery_kvar: Option<f64>,
    pub last_attempt: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub read_status: ReadStatus,
    pub last_error: Option<ObservedError>,
    pub consecutive_failures: u32,
    pub stale: bool,
}

impl ObservedState {
    pub fn unknown(now: DateTime<Utc>) -> Self {
        Self {
            enable_state: None,
            p_battery_kw: None,
            q_battery_kvar: None,
            last_attempt: now,
            last_success: None,
            read_status: ReadStatus::Unknown,
            last_error: None,
            consecutive_failures: 0,
            stale: true,
        }
    }

    /// Recompute `stale` given the current time and configured threshold.
    pub fn recompute_staleness(&mut self, now: DateTime<Utc>, stale_after: Duration) {
        self.stale = match self.last_success {
            Some(last) => now - last > stale_after,
            None => true,
        };
    }

    pub fn mark_success(
        &mut self,
        now: DateTime<Utc>,
        enable_state: u16,
        p_battery_kw: f64,
        q_battery_kvar: f64,
    ) {
        self.last_attempt = now;
        self.last_success = Some(now);
        self.enable_state = Some(enable_state);
        self.p_battery_kw = Some(p_battery_kw);
        self.q_battery_kvar = Some(q_battery_kvar);
        self.read_status = ReadStatus::Ok;
        self.last_error = None;
        self.consecutive_failures = 0;
        self.stale = false;
    }

    pub fn mark_failure(&mut self, now: DateTime<Utc>, status: ReadStatus, code: &str, message: &str) {
        self.last_attempt = now;
        self.read_status = status;
        self.last_error = Some(ObservedError {
            timestamp: now,
            code: code.to_string(),
            message: message.to_string(),
        });
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.stale = true;
    }
}

/// Engine-owned transition state, resolved by combining command progress
/// with the observed `enable_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Unknown,
}

impl Default for TransitionState {
    fn default() -> Self {
        TransitionState::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_when_never_succeeded() {
        let state = ObservedState::unknown(Utc::now());
        assert!(state.stale);
    }

    #[test]
    fn becomes_fresh_after_success_then_stale_after_window() {
        let now = Utc::now();
        let mut state = ObservedState::unknown(now);
        state.mark_success(now, 1, 10.0, 0.0);
        assert!(!state.stale);

        state.recompute_staleness(now + Duration::seconds(4), DEFAULT_STALE_AFTER);
        assert!(state.stale);
    }

    #[test]
    fn failure_increments_consecutive_failures() {
        let now = Utc::now();
        let mut state = ObservedState::unknown(now);
        state.mark_failure(now, ReadStatus::ConnectFailed, "connect_failed", "refused");
        state.mark_failure(now, ReadStatus::ConnectFailed, "connect_failed", "refused");
        assert_eq!(state.consecutive_failures, 2);
    }
}
