//! Communicator tuning knobs.
//!
//! The defaults are sized for loopback and LAN transports. Every field can be
//! overridden from the environment with [`Config::from_env`], which is how the
//! bench binary and multi-process launches are tuned without recompiling.

use std::time::Duration;

/// Default batch capacity in bytes for each per-destination send buffer.
pub const DEFAULT_BATCH_BYTES: usize = 64 * 1024;

/// Default age after which a non-empty send buffer is flushed regardless of fill.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_micros(500);

const ENV_BATCH_BYTES: &str = "HYADES_BATCH_BYTES";
const ENV_FLUSH_INTERVAL_US: &str = "HYADES_FLUSH_INTERVAL_US";
const ENV_PROGRESS_EVERY: &str = "HYADES_PROGRESS_EVERY";

/// Configuration for a [`Comm`](crate::Comm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum size of one batched transport send. An envelope larger than
    /// this is sent on its own.
    pub batch_bytes: usize,
    /// Flush a buffer once it has held data this long. `None` disables the
    /// timer; buffers then only flush when full or when forced.
    pub flush_interval: Option<Duration>,
    /// Run a full progress step every `progress_every` async calls.
    /// Values below 1 are treated as 1.
    pub progress_every: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_bytes: DEFAULT_BATCH_BYTES,
            flush_interval: Some(DEFAULT_FLUSH_INTERVAL),
            progress_every: 1,
        }
    }
}

/// Error parsing configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set but did not parse as an unsigned integer.
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
    /// `HYADES_BATCH_BYTES` was zero.
    #[error("batch size must be greater than 0")]
    ZeroBatch,
}

impl Config {
    /// Sets the per-destination batch capacity.
    #[must_use]
    pub const fn with_batch_bytes(mut self, batch_bytes: usize) -> Self {
        self.batch_bytes = batch_bytes;
        self
    }

    /// Sets (or disables) the age-based flush timer.
    #[must_use]
    pub const fn with_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets how many async calls pass between full progress steps.
    #[must_use]
    pub const fn with_progress_every(mut self, every: u32) -> Self {
        self.progress_every = every;
        self
    }

    /// Defaults overridden by `HYADES_*` environment variables.
    ///
    /// `HYADES_FLUSH_INTERVAL_US=0` disables the flush timer.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a variable is set to something unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(bytes) = parse_var(&lookup, ENV_BATCH_BYTES)? {
            if bytes == 0 {
                return Err(ConfigError::ZeroBatch);
            }
            config.batch_bytes = bytes as usize;
        }
        if let Some(us) = parse_var(&lookup, ENV_FLUSH_INTERVAL_US)? {
            config.flush_interval = (us > 0).then(|| Duration::from_micros(us));
        }
        if let Some(every) = parse_var(&lookup, ENV_PROGRESS_EVERY)? {
            config.progress_every = u32::try_from(every).unwrap_or(u32::MAX);
        }
        Ok(config)
    }

    pub(crate) fn progress_every(&self) -> u32 {
        self.progress_every.max(1)
    }
}

fn parse_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            ("HYADES_BATCH_BYTES", "4096"),
            ("HYADES_FLUSH_INTERVAL_US", "0"),
            ("HYADES_PROGRESS_EVERY", "16"),
        ]))
        .unwrap();

        assert_eq!(config.batch_bytes, 4096);
        assert_eq!(config.flush_interval, None);
        assert_eq!(config.progress_every, 16);
    }

    #[test]
    fn unset_env_keeps_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn invalid_env_value_is_reported() {
        let err = Config::from_lookup(lookup_from(&[("HYADES_BATCH_BYTES", "lots")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value \"lots\" for HYADES_BATCH_BYTES"
        );

        let err = Config::from_lookup(lookup_from(&[("HYADES_BATCH_BYTES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroBatch));
    }

    #[test]
    fn progress_every_is_at_least_one() {
        let config = Config::default().with_progress_every(0);
        assert_eq!(config.progress_every(), 1);
    }
}
