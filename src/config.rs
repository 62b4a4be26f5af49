use std::{env, num::NonZeroUsize, str::FromStr, thread, time::Duration};

use crate::{error::ConfigError, logging::DEFAULT_LOG_CAPACITY};

const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
const DEFAULT_BLOB_URL: &str = "http://localhost:9900";
const DEFAULT_MAX_QUEUED: usize = 4;
const DEFAULT_CYCLE_DELAY: Duration = Duration::from_millis(80);

/// Settings of a training session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    server_url: String,
    blob_url: String,
    workers: NonZeroUsize,
    max_queued: usize,
    cycle_delay: Duration,
    log_capacity: usize,
}

impl SessionConfig {
    /// Reads the configuration from `PLAYGROUND_*` environment variables,
    /// falling back to the defaults for unset ones.
    ///
    /// # Errors
    /// `ConfigError::Invalid` when a set variable doesn't parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = env::var("PLAYGROUND_SERVER_URL") {
            config.server_url = url;
        }

        if let Ok(url) = env::var("PLAYGROUND_BLOB_URL") {
            config.blob_url = url;
        }

        if let Some(workers) = parse_var::<NonZeroUsize>("PLAYGROUND_WORKERS")? {
            config.workers = workers;
        }

        if let Some(max_queued) = parse_var("PLAYGROUND_MAX_QUEUED")? {
            config.max_queued = max_queued;
        }

        if let Some(ms) = parse_var("PLAYGROUND_CYCLE_DELAY_MS")? {
            config.cycle_delay = Duration::from_millis(ms);
        }

        if let Some(capacity) = parse_var("PLAYGROUND_LOG_CAPACITY")? {
            config.log_capacity = capacity;
        }

        Ok(config)
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_blob_url(mut self, url: impl Into<String>) -> Self {
        self.blob_url = url.into();
        self
    }

    pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }

    pub fn with_cycle_delay(mut self, delay: Duration) -> Self {
        self.cycle_delay = delay;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Base url of the coordination server.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Base url `local|` blobs are fetched from.
    pub fn blob_url(&self) -> &str {
        &self.blob_url
    }

    /// Size of the worker pool.
    pub fn workers(&self) -> usize {
        self.workers.get()
    }

    /// Queue length at which the session stops requesting assignments.
    pub fn max_queued(&self) -> usize {
        self.max_queued
    }

    /// Pause between two assignment requests.
    pub fn cycle_delay(&self) -> Duration {
        self.cycle_delay
    }

    /// Amount of log entries retained.
    pub fn log_capacity(&self) -> usize {
        self.log_capacity
    }
}

impl Default for SessionConfig {
    /// Leaves one core to the host, keeping at least one worker.
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let workers = NonZeroUsize::new(cores.saturating_sub(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            blob_url: DEFAULT_BLOB_URL.to_string(),
            workers,
            max_queued: DEFAULT_MAX_QUEUED,
            cycle_delay: DEFAULT_CYCLE_DELAY,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    let Ok(value) = env::var(var) else {
        return Ok(None);
    };

    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_a_core_free() {
        let config = SessionConfig::default();
        assert!(config.workers() >= 1);
        assert_eq!(config.max_queued(), 4);
        assert_eq!(config.cycle_delay(), Duration::from_millis(80));
        assert_eq!(config.log_capacity(), 500);
    }

    // Single test touching the environment to avoid races between tests.
    #[test]
    fn reads_and_validates_environment() {
        env::set_var("PLAYGROUND_WORKERS", "3");
        env::set_var("PLAYGROUND_CYCLE_DELAY_MS", "10");
        let config = SessionConfig::from_env().unwrap();
        assert_eq!(config.workers(), 3);
        assert_eq!(config.cycle_delay(), Duration::from_millis(10));

        env::set_var("PLAYGROUND_WORKERS", "0");
        let err = SessionConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PLAYGROUND_WORKERS", .. }));

        env::remove_var("PLAYGROUND_WORKERS");
        env::remove_var("PLAYGROUND_CYCLE_DELAY_MS");
    }
}
