use eyre::eyre;
use std::time::Duration;

use crate::buffer::DEFAULT_READ_CHUNK;

type Result<T> = eyre::Result<T>;

/// Default environment variable that turns the coverage hooks on
pub const DEFAULT_COVERAGE_ENV_VAR: &str = "WITH_COVERAGE";

/// Timings of the SIGINT -> SIGTERM -> SIGKILL escalation used when a process is closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Number of exit checks after SIGINT
    pub interrupt_polls: u32,
    /// Delay before each exit check after SIGINT
    pub interrupt_poll_interval: Duration,
    /// Number of exit checks after SIGTERM
    pub terminate_polls: u32,
    /// Delay before each exit check after SIGTERM
    pub terminate_poll_interval: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            interrupt_polls: 5,
            interrupt_poll_interval: Duration::from_millis(200),
            terminate_polls: 10,
            terminate_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ShutdownPolicy {
    /// Longest time a close can spend waiting before it resorts to SIGKILL
    pub fn worst_case(&self) -> Duration {
        self.interrupt_poll_interval * self.interrupt_polls
            + self.terminate_poll_interval * self.terminate_polls
    }
}

/// Tunables shared by the harness components
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Delay between two snapshots while waiting for strings
    pub poll_interval: Duration,
    /// Size of a single read from a wrapped descriptor
    pub read_chunk_size: usize,
    /// Process teardown timings
    pub shutdown: ShutdownPolicy,
    /// Variable that enables coverage restarts after fork
    pub coverage_env_var: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            read_chunk_size: DEFAULT_READ_CHUNK,
            shutdown: ShutdownPolicy::default(),
            coverage_env_var: DEFAULT_COVERAGE_ENV_VAR.to_string(),
        }
    }
}

impl HarnessConfig {
    /// Builds the configuration from the process environment.
    ///
    /// Recognized variables:
    /// * `PROCTEST_POLL_INTERVAL_MS`
    /// * `PROCTEST_READ_CHUNK`
    /// * `PROCTEST_INTERRUPT_GRACE_MS` - total wait after SIGINT
    /// * `PROCTEST_TERMINATE_GRACE_MS` - total wait after SIGTERM
    /// * `PROCTEST_COVERAGE_ENV`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "PROCTEST_POLL_INTERVAL_MS")? {
            if ms == 0 {
                return Err(eyre!("PROCTEST_POLL_INTERVAL_MS must be greater than zero"));
            }
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(size) = parse_var::<usize>(&lookup, "PROCTEST_READ_CHUNK")? {
            if size == 0 {
                return Err(eyre!("PROCTEST_READ_CHUNK must be greater than zero"));
            }
            config.read_chunk_size = size;
        }

        // Grace windows keep the poll counts and spread the total over them
        if let Some(ms) = parse_var::<u64>(&lookup, "PROCTEST_INTERRUPT_GRACE_MS")? {
            config.shutdown.interrupt_poll_interval =
                Duration::from_millis(ms) / config.shutdown.interrupt_polls;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PROCTEST_TERMINATE_GRACE_MS")? {
            config.shutdown.terminate_poll_interval =
                Duration::from_millis(ms) / config.shutdown.terminate_polls;
        }

        if let Some(var) = lookup("PROCTEST_COVERAGE_ENV") {
            if !var.is_empty() {
                config.coverage_env_var = var;
            }
        }

        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| eyre!("Invalid value for {} '{}': {}", key, raw, e)),
    }
}
