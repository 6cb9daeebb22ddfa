use crate::error::SupervisorError;
use chrono::{DateTime, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::time::Duration;

/// Shortest interval accepted for [`RestartPolicy::FixedInterval`].
pub const MIN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// When the supervised process is restarted. Exactly one policy is active at
/// any time.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartPolicy {
    /// Once a day at `hour:minute` local time in `timezone`.
    FixedWallClockTime { hour: u32, minute: u32, timezone: Tz },
    /// Every `duration` after the previous fire (or process start).
    FixedInterval { duration: Duration },
}

impl RestartPolicy {
    pub fn daily(hour: u32, minute: u32, timezone: Tz) -> Result<Self, SupervisorError> {
        let policy = Self::FixedWallClockTime {
            hour,
            minute,
            timezone,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn interval(duration: Duration) -> Result<Self, SupervisorError> {
        let policy = Self::FixedInterval { duration };
        policy.validate()?;
        Ok(policy)
    }

    /// Signed so that zero and negative requests reach validation instead of
    /// failing to parse.
    pub fn interval_hours(hours: i64) -> Result<Self, SupervisorError> {
        if hours < 1 {
            return Err(SupervisorError::InvalidPolicy(
                "Interval must be at least 1 hour".into(),
            ));
        }
        let seconds = u64::try_from(hours)
            .ok()
            .and_then(|hours| hours.checked_mul(3600))
            .ok_or_else(|| SupervisorError::InvalidPolicy(format!("Interval of {hours} hours is too large")))?;
        Self::interval(Duration::from_secs(seconds))
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        match self {
            Self::FixedWallClockTime { hour, minute, .. } => {
                if *hour > 23 || *minute > 59 {
                    return Err(SupervisorError::InvalidPolicy(format!(
                        "{hour:02}:{minute:02} is not a time of day"
                    )));
                }
            }
            Self::FixedInterval { duration } => {
                if *duration < MIN_INTERVAL {
                    return Err(SupervisorError::InvalidPolicy(format!(
                        "Interval of {} is shorter than {}",
                        humantime::format_duration(*duration),
                        humantime::format_duration(MIN_INTERVAL)
                    )));
                }
                if chrono::Duration::from_std(*duration).is_err() {
                    return Err(SupervisorError::InvalidPolicy(
                        "Interval is out of range".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Hours between two restarts under this policy.
    pub fn cadence_hours(&self) -> f64 {
        match self {
            Self::FixedWallClockTime { .. } => 24.0,
            Self::FixedInterval { duration } => duration.as_secs_f64() / 3600.0,
        }
    }

    /// The next instant this policy fires, strictly after `now`. Pure.
    pub fn schedule_next(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SupervisorError> {
        match self {
            Self::FixedInterval { duration } => {
                let step = chrono::Duration::from_std(*duration)
                    .map_err(|err| SupervisorError::InvalidPolicy(err.to_string()))?;
                now.checked_add_signed(step).ok_or_else(|| {
                    SupervisorError::SchedulerStall(format!("{now} + {step} is out of range"))
                })
            }
            Self::FixedWallClockTime {
                hour,
                minute,
                timezone,
            } => next_wall_clock(*hour, *minute, timezone, now),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedWallClockTime {
                hour,
                minute,
                timezone,
            } => write!(f, "daily at {hour:02}:{minute:02} {}", timezone.name()),
            Self::FixedInterval { duration } => {
                write!(f, "every {}", humantime::format_duration(*duration))
            }
        }
    }
}

fn next_wall_clock(
    hour: u32,
    minute: u32,
    timezone: &Tz,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SupervisorError> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
        SupervisorError::InvalidPolicy(format!("{hour:02}:{minute:02} is not a time of day"))
    })?;

    // Today or tomorrow; a third day is only reached if tomorrow cannot be
    // resolved in this zone.
    let mut day = now.with_timezone(timezone).date_naive();
    for _ in 0..3 {
        if let Some(candidate) = resolve_local(timezone, day.and_time(time)) {
            if candidate > now {
                return Ok(candidate);
            }
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    Err(SupervisorError::SchedulerStall(format!(
        "No occurrence of {hour:02}:{minute:02} {} after {now}",
        timezone.name()
    )))
}

/// Maps a local time to an instant. Ambiguous times (clocks going back) take
/// the first occurrence; times inside a gap (clocks going forward) move to
/// the same wall clock time one hour later.
fn resolve_local(timezone: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    let resolved = match timezone.from_local_datetime(&local) {
        LocalResult::Single(at) => Some(at),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => timezone
            .from_local_datetime(&(local + chrono::Duration::hours(1)))
            .earliest(),
    };
    resolved.map(|at| at.with_timezone(&Utc))
}
