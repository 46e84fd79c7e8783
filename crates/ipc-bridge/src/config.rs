//! Bridge configuration.
//!
//! Immutable once handed to [`crate::Bridge::start`], which validates it
//! before doing anything else. Invalid values fail; nothing is clamped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::events::BridgeObserver;
use crate::process::{CommandSpawner, WorkerSpawner};
use crate::tracker::MAX_CALL_TIMEOUT;
use crate::version::{ExactMatch, PROTOCOL_VERSION, VersionPolicy};

/// Launch target for the worker subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Clone, Deserialize)]
pub struct BridgeConfig {
    pub worker: WorkerCommand,
    #[serde(default = "defaults::max_inflight")]
    pub max_inflight: usize,
    #[serde(default = "defaults::max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "defaults::spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,
    #[serde(default = "defaults::default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "defaults::heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "defaults::circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "defaults::circuit_cooldown_ms")]
    pub circuit_cooldown_ms: u64,
    #[serde(default = "defaults::stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "defaults::protocol_version")]
    pub protocol_version: String,
    #[serde(skip, default = "defaults::version_policy")]
    pub version_policy: Arc<dyn VersionPolicy>,
    #[serde(skip, default = "defaults::spawner")]
    pub spawner: Arc<dyn WorkerSpawner>,
    #[serde(skip)]
    pub observers: Vec<Arc<dyn BridgeObserver>>,
}

mod defaults {
    use super::*;

    pub fn max_inflight() -> usize {
        4
    }
    pub fn max_queue_size() -> usize {
        64
    }
    pub fn spawn_timeout_ms() -> u64 {
        10_000
    }
    pub fn default_timeout_ms() -> u64 {
        30_000
    }
    pub fn heartbeat_interval_ms() -> u64 {
        5_000
    }
    pub fn heartbeat_timeout_ms() -> u64 {
        2_000
    }
    pub fn circuit_failure_threshold() -> u32 {
        5
    }
    pub fn circuit_cooldown_ms() -> u64 {
        30_000
    }
    pub fn stop_grace_ms() -> u64 {
        2_000
    }
    pub fn protocol_version() -> String {
        PROTOCOL_VERSION.to_string()
    }
    pub fn version_policy() -> Arc<dyn VersionPolicy> {
        Arc::new(ExactMatch)
    }
    pub fn spawner() -> Arc<dyn WorkerSpawner> {
        Arc::new(CommandSpawner)
    }
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("worker", &self.worker)
            .field("max_inflight", &self.max_inflight)
            .field("max_queue_size", &self.max_queue_size)
            .field("spawn_timeout_ms", &self.spawn_timeout_ms)
            .field("default_timeout_ms", &self.default_timeout_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("heartbeat_timeout_ms", &self.heartbeat_timeout_ms)
            .field("circuit_failure_threshold", &self.circuit_failure_threshold)
            .field("circuit_cooldown_ms", &self.circuit_cooldown_ms)
            .field("stop_grace_ms", &self.stop_grace_ms)
            .field("protocol_version", &self.protocol_version)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl BridgeConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            max_inflight: defaults::max_inflight(),
            max_queue_size: defaults::max_queue_size(),
            spawn_timeout_ms: defaults::spawn_timeout_ms(),
            default_timeout_ms: defaults::default_timeout_ms(),
            heartbeat_interval_ms: defaults::heartbeat_interval_ms(),
            heartbeat_timeout_ms: defaults::heartbeat_timeout_ms(),
            circuit_failure_threshold: defaults::circuit_failure_threshold(),
            circuit_cooldown_ms: defaults::circuit_cooldown_ms(),
            stop_grace_ms: defaults::stop_grace_ms(),
            protocol_version: defaults::protocol_version(),
            version_policy: defaults::version_policy(),
            spawner: defaults::spawner(),
            observers: Vec::new(),
        }
    }

    pub fn with_max_inflight(mut self, n: usize) -> Self {
        self.max_inflight = n;
        self
    }

    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout_ms = as_millis(timeout);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = as_millis(timeout);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = as_millis(interval);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout_ms = as_millis(timeout);
        self
    }

    pub fn with_circuit_failure_threshold(mut self, threshold: u32) -> Self {
        self.circuit_failure_threshold = threshold;
        self
    }

    pub fn with_circuit_cooldown(mut self, cooldown: Duration) -> Self {
        self.circuit_cooldown_ms = as_millis(cooldown);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace_ms = as_millis(grace);
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_version_policy(mut self, policy: Arc<dyn VersionPolicy>) -> Self {
        self.version_policy = policy;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BridgeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Check every field. Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("max_inflight", self.max_inflight as u64, 1)?;
        // max_queue_size >= 0 holds by type; zero disables queueing.
        at_least("spawn_timeout_ms", self.spawn_timeout_ms, 1)?;
        at_least("default_timeout_ms", self.default_timeout_ms, 1)?;
        at_least("heartbeat_interval_ms", self.heartbeat_interval_ms, 1)?;
        at_least("heartbeat_timeout_ms", self.heartbeat_timeout_ms, 1)?;
        let max_timeout_ms = as_millis(MAX_CALL_TIMEOUT);
        at_most("default_timeout_ms", self.default_timeout_ms, max_timeout_ms)?;
        at_most("heartbeat_timeout_ms", self.heartbeat_timeout_ms, max_timeout_ms)?;
        at_least(
            "circuit_failure_threshold",
            self.circuit_failure_threshold as u64,
            1,
        )?;
        at_least("circuit_cooldown_ms", self.circuit_cooldown_ms, 1)?;
        if self.protocol_version.trim().is_empty() {
            return Err(ConfigError::Empty("protocol_version"));
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(ConfigError::Empty("worker.program"));
        }
        Ok(())
    }
}

fn at_least(field: &'static str, actual: u64, min: u64) -> Result<(), ConfigError> {
    if actual < min {
        return Err(ConfigError::TooSmall { field, min, actual });
    }
    Ok(())
}

fn at_most(field: &'static str, actual: u64, max: u64) -> Result<(), ConfigError> {
    if actual > max {
        return Err(ConfigError::TooLarge { field, max, actual });
    }
    Ok(())
}

fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
