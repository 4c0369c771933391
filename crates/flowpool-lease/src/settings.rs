//! Pool coordination settings.
//!
//! Deserializable from the `[pool]`, `[lease]`, `[schedulers]` and
//! `[readiness]` tables of the server's TOML file. Every field has a
//! default so an empty file is a valid configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Window the `random` initial delay is drawn from, in whole seconds.
const RANDOM_DELAY_SECS: std::ops::RangeInclusive<u64> = 5..=10;

/// All settings for one pool participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub pool: PoolConfig,
    pub lease: LeaseGroupConfig,
    pub schedulers: SchedulerGroupConfig,
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Names and labels every lease object of the pool. Pools sharing a
    /// namespace must use distinct names.
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "flow-pool".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseGroupConfig {
    pub member: LeaseConfig,
    pub leader: LeaseConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Seconds a claim stays valid without renewal.
    pub duration_secs: i32,
    /// Whether this process participates in this role at all.
    pub enabled: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 30,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerGroupConfig {
    pub leader: SchedulerConfig,
    pub member: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cycle interval, e.g. "30s".
    pub interval: String,
    /// "random", or a number of seconds.
    pub initial_delay: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: "30s".into(),
            initial_delay: "random".into(),
        }
    }
}

impl SchedulerConfig {
    /// Parses the textual config into a schedule.
    pub fn schedule(&self) -> Result<Schedule, String> {
        Ok(Schedule {
            interval: parse_duration(&self.interval)?,
            initial_delay: InitialDelay::parse(&self.initial_delay)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Report not-ready while no member lease is held.
    pub require_lease: bool,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            require_lease: true,
        }
    }
}

/// When a controller fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub initial_delay: InitialDelay,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: InitialDelay::Random,
        }
    }
}

/// Delay before a controller's first cycle.
///
/// Replicas of a deployment usually start together; the random delay keeps
/// them from all hitting the store in the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialDelay {
    Random,
    Fixed(Duration),
}

impl InitialDelay {
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("random") {
            return Ok(InitialDelay::Random);
        }
        let secs: u64 = input.parse().map_err(|_| {
            format!("invalid initial delay '{input}'. expected 'random' or a number of seconds")
        })?;
        Ok(InitialDelay::Fixed(Duration::from_secs(secs)))
    }

    /// Returns the concrete delay, drawing one for `Random`.
    pub fn resolve(&self) -> Duration {
        match self {
            InitialDelay::Random => Duration::from_secs(rand::rng().random_range(RANDOM_DELAY_SECS)),
            InitialDelay::Fixed(d) => *d,
        }
    }
}

/// Parses a duration like "30s", "500ms", "2m" or "1h". A bare number is
/// taken as seconds. Case insensitive.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration string".into());
    }

    let lower = input.to_ascii_lowercase();

    let (num_str, millis_per_unit) = if let Some(n) = lower.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = lower.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = lower.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (lower.as_str(), 1_000)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: '{input}'"))?;

    let millis = num
        .checked_mul(millis_per_unit)
        .ok_or_else(|| format!("duration overflow: '{input}'"))?;
    if millis == 0 {
        return Err(format!("duration must be positive: '{input}'"));
    }
    Ok(Duration::from_millis(millis))
}
