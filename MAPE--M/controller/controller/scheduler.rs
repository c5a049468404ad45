use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ControllerError;

/// Timing parameters of [`Controller::run`](crate::Controller::run), in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTiming {
    /// Seconds between cycle starts; `0` runs back to back, negative skips the loop.
    pub loop_period: f64,
    /// Total seconds to run; negative runs forever.
    pub max_runtime: f64,
    /// Seconds between broadcasts; non-positive falls back to `loop_period`.
    pub send_period: f64,
}

impl Default for RunTiming {
    fn default() -> Self {
        Self {
            loop_period: 0.5,
            max_runtime: -1.0,
            send_period: -1.0,
        }
    }
}

impl RunTiming {
    /// Bundles the three run parameters.
    #[must_use]
    pub const fn new(loop_period: f64, max_runtime: f64, send_period: f64) -> Self {
        Self {
            loop_period,
            max_runtime,
            send_period,
        }
    }

    /// Rejects values that cannot be turned into durations.
    pub fn validate(&self) -> Result<(), ControllerError> {
        for (label, value) in [
            ("loop_period", self.loop_period),
            ("max_runtime", self.max_runtime),
            ("send_period", self.send_period),
        ] {
            if !value.is_finite() {
                return Err(ControllerError::InvalidTiming(format!(
                    "{label} must be finite, got {value}"
                )));
            }
            if value > 0.0 && Duration::try_from_secs_f64(value).is_err() {
                return Err(ControllerError::InvalidTiming(format!(
                    "{label} of {value}s is out of range"
                )));
            }
        }
        Ok(())
    }

    /// Returns false when the scheduler should not cycle at all.
    #[must_use]
    pub fn loops(&self) -> bool {
        self.loop_period >= 0.0
    }

    /// Interval between cycle epochs; zero when cycles run back to back.
    #[must_use]
    pub fn loop_interval(&self) -> Duration {
        seconds(self.loop_period)
    }

    /// Interval between broadcasts.
    #[must_use]
    pub fn send_interval(&self) -> Duration {
        if self.send_period > 0.0 {
            seconds(self.send_period)
        } else {
            self.loop_interval()
        }
    }

    /// Point after which no new cycle starts, if bounded.
    #[must_use]
    pub fn deadline(&self, start: Instant) -> Option<Instant> {
        if self.max_runtime < 0.0 {
            return None;
        }
        start.checked_add(seconds(self.max_runtime))
    }
}

fn seconds(value: f64) -> Duration {
    if value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Moves `epoch` forward by whole `period`s until it is no longer before `now`.
///
/// Missed windows collapse into one step. A zero period never advances.
#[must_use]
pub fn advance_epoch(epoch: Instant, period: Duration, now: Instant) -> Instant {
    if epoch >= now || period.is_zero() {
        return epoch;
    }
    let behind = (now - epoch).as_nanos();
    let step = period.as_nanos();
    let steps = behind.div_ceil(step);
    u64::try_from(steps * step)
        .ok()
        .and_then(|nanos| epoch.checked_add(Duration::from_nanos(nanos)))
        .unwrap_or(now)
}
