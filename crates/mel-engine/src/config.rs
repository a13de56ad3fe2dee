//! Engine configuration from environment variables

use std::time::Duration;

/// Errors from configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: String, value: String },
}

/// Engine tuning knobs, loaded from the environment
///
/// | Variable | Default |
/// |---|---|
/// | `DB_MAX_OPEN_CONNS` | 25 |
/// | `DB_MAX_IDLE_CONNS` | 10 |
/// | `DB_CONN_MAX_LIFETIME` | 5m |
/// | `WORKER_TIMEOUT` | 60s |
/// | `LEASE_DURATION` | 120s |
/// | `CLAIM_BATCH_SIZE` | 10 |
/// | `STEP_MAX_ATTEMPTS` | 3 |
/// | `RUN_MAX_STEPS` | 10000 |
///
/// Durations accept `90s`, `5m`, `2h`, `1500ms`, or a bare number of seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Database pool size upper bound
    pub db_max_open_conns: u32,

    /// Idle pool bound
    pub db_max_idle_conns: u32,

    /// Connection recycling age
    pub db_conn_max_lifetime: Duration,

    /// Threshold for dead-worker detection
    pub worker_timeout: Duration,

    /// Queue item claim lease
    pub lease_duration: Duration,

    /// Max items per claim
    pub claim_batch_size: usize,

    /// Retry ceiling per step
    pub step_max_attempts: u32,

    /// Per-run loop guard
    pub run_max_steps: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_max_open_conns: 25,
            db_max_idle_conns: 10,
            db_conn_max_lifetime: Duration::from_secs(300),
            worker_timeout: Duration::from_secs(60),
            lease_duration: Duration::from_secs(120),
            claim_batch_size: 10,
            step_max_attempts: 3,
            run_max_steps: 10_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            db_max_open_conns: env_int("DB_MAX_OPEN_CONNS", defaults.db_max_open_conns)?,
            db_max_idle_conns: env_int("DB_MAX_IDLE_CONNS", defaults.db_max_idle_conns)?,
            db_conn_max_lifetime: env_duration(
                "DB_CONN_MAX_LIFETIME",
                defaults.db_conn_max_lifetime,
            )?,
            worker_timeout: env_duration("WORKER_TIMEOUT", defaults.worker_timeout)?,
            lease_duration: env_duration("LEASE_DURATION", defaults.lease_duration)?,
            claim_batch_size: env_int("CLAIM_BATCH_SIZE", defaults.claim_batch_size)?,
            step_max_attempts: env_int("STEP_MAX_ATTEMPTS", defaults.step_max_attempts)?,
            run_max_steps: env_int("RUN_MAX_STEPS", defaults.run_max_steps)?,
        })
    }
}

fn env_int<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn env_duration(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(value) => parse_duration(&value).ok_or_else(|| ConfigError::Invalid {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `1500ms`, `90s`, `5m`, `2h`, or a bare number of seconds.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();

    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = value.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = value.strip_suffix('h') {
        return hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }

    value.parse().ok().map(Duration::from_secs)
}
