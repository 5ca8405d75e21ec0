//! Runtime configuration.
//!
//! Read once when a [`crate::Runtime`] or [`crate::threads::ThreadManager`] is
//! constructed. Values come from [`RuntimeConfig::default`], optionally
//! overlaid with `HILTI_*` environment variables or, with the `toml-config`
//! feature, a TOML document.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(1);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Start a worker pool. A runtime without one runs single-threaded.
    pub threaded: bool,
    pub workers: usize,
    /// Upper bound on a single idle wait of a worker with an empty queue.
    #[serde(rename = "idle_sleep_us", with = "micros")]
    pub idle_sleep: Duration,
    /// How long a graceful stop may take before workers are cancelled.
    #[serde(rename = "grace_period_ms", with = "millis")]
    pub grace_period: Duration,
    /// Native stack size of each worker thread, in bytes.
    pub stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            threaded: true,
            workers,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            grace_period: DEFAULT_GRACE_PERIOD,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    pub fn single_threaded() -> Self {
        Self {
            threaded: false,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlays `HILTI_*` settings obtained through `lookup` onto `self`.
    ///
    /// Unparsable values are reported rather than skipped.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("HILTI_THREADED") {
            self.threaded = parse_bool("HILTI_THREADED", &value)?;
        }
        if let Some(value) = lookup("HILTI_WORKERS") {
            self.workers = parse_number("HILTI_WORKERS", &value)?;
        }
        if let Some(value) = lookup("HILTI_IDLE_SLEEP_US") {
            self.idle_sleep = Duration::from_micros(parse_number("HILTI_IDLE_SLEEP_US", &value)?);
        }
        if let Some(value) = lookup("HILTI_GRACE_PERIOD_MS") {
            self.grace_period =
                Duration::from_millis(parse_number("HILTI_GRACE_PERIOD_MS", &value)?);
        }
        if let Some(value) = lookup("HILTI_STACK_SIZE") {
            self.stack_size = parse_number("HILTI_STACK_SIZE", &value)?;
        }
        Ok(self)
    }

    /// Parses the `[runtime]` table of a TOML document; absent keys keep
    /// their defaults.
    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(source: &str) -> Result<Self> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct ConfigFile {
            runtime: RuntimeConfig,
        }

        let file: ConfigFile =
            toml::from_str(source).map_err(|err| RuntimeError::config(err.to_string()))?;
        file.runtime.validate()?;
        Ok(file.runtime)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threaded && self.workers == 0 {
            return Err(RuntimeError::config("worker count must be at least 1"));
        }
        if self.stack_size == 0 {
            return Err(RuntimeError::config("worker stack size must be non-zero"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RuntimeError::config(format!("{key}: expected a number, got `{value}`")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RuntimeError::config(format!(
            "{key}: expected a boolean, got `{value}`"
        ))),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_micros()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}
