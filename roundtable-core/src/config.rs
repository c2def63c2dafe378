use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const HOUR: Duration = Duration::from_secs(3600);

/// Configuration for the session runtime
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Sessions allowed to run an agent step at the same time
    pub max_concurrent_active: usize,
    /// Live (non-terminal) sessions the store will hold (None = unlimited)
    pub max_sessions: Option<usize>,
    /// Maximum age of a session, measured from creation
    pub session_ttl: Duration,
    /// Maximum time since the session was last touched
    pub idle_timeout: Duration,
    /// How often the eviction scheduler scans the store
    pub eviction_interval: Duration,
    /// Upper bound on a single agent step
    pub step_timeout: Duration,
    /// Default wait for an admission slot (None = wait until cancelled)
    pub admission_timeout: Option<Duration>,
    pub max_topic_chars: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_active: 100,
            max_sessions: Some(100),
            session_ttl: 24 * HOUR,
            idle_timeout: 2 * HOUR,
            eviction_interval: HOUR,
            step_timeout: Duration::from_secs(300),
            admission_timeout: Some(Duration::from_secs(30)),
            max_topic_chars: 60,
        }
    }
}

impl RuntimeConfig {
    /// Preset for development: fewer sessions, short lived
    pub fn development() -> Self {
        Self {
            max_sessions: Some(50),
            session_ttl: 2 * HOUR,
            ..Self::default()
        }
    }

    pub fn production() -> Self {
        Self {
            max_sessions: Some(200),
            session_ttl: 12 * HOUR,
            ..Self::default()
        }
    }

    /// Build the configuration from the environment.
    ///
    /// `ENVIRONMENT` (`development` | `production`, default `development`) picks
    /// the preset; each field can then be overridden:
    /// - `ROUNDTABLE_MAX_CONCURRENT_ACTIVE`
    /// - `ROUNDTABLE_MAX_SESSIONS` (`0` = unlimited)
    /// - `ROUNDTABLE_SESSION_TTL_SECS`
    /// - `ROUNDTABLE_IDLE_TIMEOUT_SECS`
    /// - `ROUNDTABLE_EVICTION_INTERVAL_SECS`
    /// - `ROUNDTABLE_STEP_TIMEOUT_SECS`
    /// - `ROUNDTABLE_ADMISSION_TIMEOUT_SECS` (`0` = wait indefinitely)
    /// - `ROUNDTABLE_MAX_TOPIC_CHARS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("ENVIRONMENT").map(|v| v.to_lowercase()).as_deref() {
            Some("production") => Self::production(),
            _ => Self::development(),
        };

        if let Some(n) = parse::<usize, _>(&lookup, "ROUNDTABLE_MAX_CONCURRENT_ACTIVE")? {
            config.max_concurrent_active = n;
        }
        if let Some(n) = parse::<usize, _>(&lookup, "ROUNDTABLE_MAX_SESSIONS")? {
            config.max_sessions = (n > 0).then_some(n);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "ROUNDTABLE_SESSION_TTL_SECS")? {
            config.session_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "ROUNDTABLE_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "ROUNDTABLE_EVICTION_INTERVAL_SECS")? {
            config.eviction_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "ROUNDTABLE_STEP_TIMEOUT_SECS")? {
            config.step_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "ROUNDTABLE_ADMISSION_TIMEOUT_SECS")? {
            config.admission_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(n) = parse::<usize, _>(&lookup, "ROUNDTABLE_MAX_TOPIC_CHARS")? {
            config.max_topic_chars = n;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_active == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_active must be at least 1".to_string(),
            ));
        }
        if self.eviction_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "eviction_interval must be non-zero".to_string(),
            ));
        }
        if self.step_timeout.is_zero() {
            return Err(ConfigError::Invalid("step_timeout must be non-zero".to_string()));
        }
        if self.max_topic_chars == 0 {
            return Err(ConfigError::Invalid(
                "max_topic_chars must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Parse {
            name: name.to_string(),
            value: raw,
        }),
    }
}
