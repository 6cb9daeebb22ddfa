use crate::error::SupervisorError;
use crate::policy::RestartPolicy;
use crate::process::{CommandSpec, TargetMatch};
use crate::supervisor::StopSettings;
use chrono::{NaiveTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RestartdConfig {
    #[serde(default = "default_log")]
    pub log: String,
    /// Required by `serve`, optional for `watchdog`.
    pub listen: Option<SocketAddr>,
    /// Zone timestamps are reported in.
    #[serde(with = "timezone", default = "default_timezone")]
    pub timezone: Tz,
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub stop: StopProperties,
    pub watchdog: Option<WatchdogConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum ScheduleConfig {
    Daily {
        /// `HH:MM`
        at: String,
        #[serde(with = "timezone", default = "default_timezone")]
        timezone: Tz,
    },
    Interval {
        #[serde(with = "humantime_serde")]
        every: Duration,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct StopProperties {
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub grace_period: Duration,
    #[serde(with = "humantime_serde", default = "default_ack_delay")]
    pub ack_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_retry_after")]
    pub retry_after: Duration,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct WatchdogConfig {
    pub command: String,
    pub working_directory: Option<PathBuf>,
    pub target: TargetMatch,
}

impl ScheduleConfig {
    pub fn to_policy(&self) -> Result<RestartPolicy, SupervisorError> {
        match self {
            ScheduleConfig::Daily { at, timezone } => {
                let time = NaiveTime::parse_from_str(at, "%H:%M").map_err(|err| {
                    SupervisorError::InvalidPolicy(format!("Invalid time of day {at:?}: {err}"))
                })?;
                RestartPolicy::daily(time.hour(), time.minute(), *timezone)
            }
            ScheduleConfig::Interval { every } => RestartPolicy::interval(*every),
        }
    }
}

impl StopProperties {
    pub fn settings(&self) -> StopSettings {
        StopSettings {
            grace_period: self.grace_period,
            ack_delay: self.ack_delay,
        }
    }
}

impl WatchdogConfig {
    /// Spawned targets carry the env marker whenever that is how they are
    /// matched.
    pub fn command_spec(&self) -> CommandSpec {
        let marker = match &self.target {
            TargetMatch::EnvMarker { value } => Some(value.clone()),
            TargetMatch::CommandLine { .. } => None,
        };
        CommandSpec {
            command: self.command.clone(),
            working_directory: self.working_directory.clone(),
            marker,
        }
    }
}

fn default_log() -> String {
    "info".into()
}

fn default_timezone() -> Tz {
    Tz::UTC
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_ack_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_after() -> Duration {
    Duration::from_secs(30)
}

impl Default for StopProperties {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            ack_delay: default_ack_delay(),
            retry_after: default_retry_after(),
        }
    }
}

mod timezone {
    use chrono_tz::Tz;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(timezone: &Tz, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(timezone.name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Tz, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse::<Tz>().map_err(serde::de::Error::custom)
    }
}
