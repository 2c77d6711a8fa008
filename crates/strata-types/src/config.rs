//! Global configuration types for Strata.
//!
//! `GlobalConfig` represents the top-level `config.toml`. Every field has a
//! default so a missing or partial file still yields a usable configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `~/.strata/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Explicit database URL; defaults to `sqlite://{data_dir}/strata.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Calculation codes the local backend can run, keyed by code name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub calculations: BTreeMap<String, CalculationCommand>,
}

/// An executable registered under a calculation code.
///
/// The program receives the calculation request as JSON on stdin and must
/// print a JSON object of outputs on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill the job and fail it after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CalculationCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Scheduling and polling policy for the engine and daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// First delay between polls while `run` blocks on a wait.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound for the polling delay.
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    /// Multiplier applied to the delay after each unproductive poll.
    #[serde(default = "default_poll_backoff")]
    pub poll_backoff: f64,

    /// Concurrent resume workers in the daemon.
    #[serde(default = "default_daemon_workers")]
    pub daemon_workers: usize,

    /// How often the daemon re-polls unfinished processes.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Maximum serialized size of a chain context.
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_max_poll_interval_ms() -> u64 {
    2_000
}

fn default_poll_backoff() -> f64 {
    2.0
}

fn default_daemon_workers() -> usize {
    4
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_max_context_bytes() -> usize {
    10_485_760
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            poll_backoff: default_poll_backoff(),
            daemon_workers: default_daemon_workers(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_context_bytes: default_max_context_bytes(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Next polling delay after `current`, capped at `max_poll_interval_ms`.
    pub fn next_poll_interval(&self, current: Duration) -> Duration {
        let factor = if self.poll_backoff < 1.0 { 1.0 } else { self.poll_backoff };
        let next = current.mul_f64(factor);
        next.min(Duration::from_millis(self.max_poll_interval_ms))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
