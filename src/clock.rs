//! Clock-skew check and staged-start deadline arithmetic.
//!
//! The coordinator and every agent exchange their local time once at
//! handshake. Beyond the bound below, a run cannot trust that "start
//! everyone at T" actually lands everyone within the same window, so the
//! handshake is rejected outright rather than silently producing skewed
//! results.

use crate::error::{Result, WarpcoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Maximum tolerated clock skew between coordinator and agent at handshake.
pub const MAX_CLOCK_SKEW: ChronoDuration = ChronoDuration::seconds(1);

/// Delay added to "now" before broadcasting a benchmark-stage start, to give
/// every agent's request round-trip time to land before the deadline.
pub const BENCHMARK_START_DELAY: ChronoDuration = ChronoDuration::seconds(3);

/// Same, for the (usually much shorter) prepare stage.
pub const PREPARE_START_DELAY: ChronoDuration = ChronoDuration::seconds(1);

/// Wraps the coordinator's view of its own clock plus the skew observed
/// against each agent at handshake time, and computes deadlines for staged
/// starts relative to that clock.
#[derive(Debug, Clone, Copy)]
pub struct SyncClock {
    /// `agent_time - coordinator_time` observed at handshake. Informational;
    /// the handshake itself rejects skew beyond `MAX_CLOCK_SKEW` and does not
    /// attempt to compensate for smaller skew afterward.
    pub observed_skew: ChronoDuration,
}

impl SyncClock {
    /// Validate the skew between a coordinator-stamped request time and the
    /// agent's reported local time at handshake. Returns the observed skew
    /// on success.
    pub fn check_handshake(coordinator_time: DateTime<Utc>, agent_time: DateTime<Utc>) -> Result<Self> {
        let skew = agent_time - coordinator_time;
        if skew.abs() > MAX_CLOCK_SKEW {
            return Err(WarpcoreError::Timing(format!(
                "clock skew {skew} exceeds bound of {MAX_CLOCK_SKEW}"
            )));
        }
        Ok(Self { observed_skew: skew })
    }

    pub fn benchmark_start_deadline(now: DateTime<Utc>) -> DateTime<Utc> {
        now + BENCHMARK_START_DELAY
    }

    pub fn prepare_start_deadline(now: DateTime<Utc>) -> DateTime<Utc> {
        now + PREPARE_START_DELAY
    }

    /// Resolve a `--syncstart` value (spec §6.4/SPEC_FULL §4.8) into an
    /// absolute deadline. A clock-of-day value resolves to the next
    /// occurrence of that time, today if still ahead of `now` or tomorrow
    /// otherwise; a relative value is just `now + delay`.
    pub fn resolve_syncstart(now: DateTime<Utc>, syncstart: crate::cli::SyncStart) -> DateTime<Utc> {
        use crate::cli::SyncStart;
        match syncstart {
            SyncStart::Relative { delay } => now + ChronoDuration::from_std(delay).unwrap_or_default(),
            SyncStart::ClockTime { hour, minute } => {
                let today = now
                    .date_naive()
                    .and_hms_opt(hour, minute, 0)
                    .expect("hour/minute validated at parse time");
                let candidate = today.and_utc();
                if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::days(1)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_within_bound_succeeds() {
        let now = Utc::now();
        let clock = SyncClock::check_handshake(now, now + ChronoDuration::milliseconds(500)).unwrap();
        assert!(clock.observed_skew.num_milliseconds() >= 0);
    }

    #[test]
    fn handshake_beyond_bound_fails() {
        let now = Utc::now();
        let result = SyncClock::check_handshake(now, now + ChronoDuration::seconds(2));
        assert!(result.is_err());
    }

    #[test]
    fn deadlines_add_expected_delays() {
        let now = Utc::now();
        assert_eq!(SyncClock::benchmark_start_deadline(now), now + BENCHMARK_START_DELAY);
        assert_eq!(SyncClock::prepare_start_deadline(now), now + PREPARE_START_DELAY);
    }

    #[test]
    fn resolve_syncstart_relative() {
        let now = Utc::now();
        let deadline = SyncClock::resolve_syncstart(now, crate::cli::SyncStart::Relative { delay: std::time::Duration::from_secs(3) });
        assert_eq!(deadline, now + ChronoDuration::seconds(3));
    }

    #[test]
    fn resolve_syncstart_clock_time_rolls_to_tomorrow_if_past() {
        let now = Utc::now();
        let past_hour = if now.format("%H").to_string() == "00" { 23 } else { 0 };
        let deadline = SyncClock::resolve_syncstart(now, crate::cli::SyncStart::ClockTime { hour: past_hour, minute: 0 });
        assert!(deadline > now);
    }
}
