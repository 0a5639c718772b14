//! Engine configuration.
//!
//! Loaded from a TOML file, then overridden from the environment:
//!
//! - `SPLITFLOW_BACKEND`: `local-pool`, `batch-scheduler` or `distributed-cluster`
//! - `SPLITFLOW_WORKERS`: worker count for the local pool and local cluster
//! - `SPLITFLOW_SUBMIT_ARGS`: resource directives passed to the batch scheduler
//! - `SPLITFLOW_CONTAINER_RUNTIME`: `singularity` or `docker`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::BackendKind;
use crate::error::{helpers::config_not_found, ErrorCode, Result, SplitflowError};
use crate::execution::ContainerRuntime;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub container: ContainerConfig,
}

/// Local process pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Concurrent worker count
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// HPC batch scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Resource directives passed through verbatim, e.g. `-t 20 --mem=4GB`
    #[serde(default)]
    pub submit_args: String,

    /// Delay between job status checks
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Retry policy for the submission step only
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_sbatch")]
    pub sbatch: String,

    #[serde(default = "default_squeue")]
    pub squeue: String,

    #[serde(default = "default_sacct")]
    pub sacct: String,

    #[serde(default = "default_scancel")]
    pub scancel: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            submit_args: String::new(),
            poll_interval: default_poll_interval(),
            retry: RetryPolicy::default(),
            sbatch: default_sbatch(),
            squeue: default_squeue(),
            sacct: default_sacct(),
            scancel: default_scancel(),
        }
    }
}

/// Distributed cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Worker count for the in-process cluster
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Scheduler address reported by remote clients
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            address: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Cache leases and waiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// A lease whose heartbeat is older than this is reclaimable
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,

    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Poll interval while another process holds a lease
    #[serde(with = "humantime_serde", default = "default_wait_poll_interval")]
    pub wait_poll_interval: Duration,

    /// Give up waiting on a foreign lease after this long; unbounded if unset
    #[serde(with = "humantime_serde", default)]
    pub claim_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            heartbeat_interval: default_heartbeat_interval(),
            wait_poll_interval: default_wait_poll_interval(),
            claim_timeout: None,
        }
    }
}

/// Container runtime used for tasks that declare an image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub runtime: ContainerRuntime,

    /// Runtime binary; defaults to the runtime's own name
    #[serde(default)]
    pub binary: Option<PathBuf>,
}

impl ContainerConfig {
    pub fn binary(&self) -> String {
        self.binary
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| self.runtime.default_binary().to_string())
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first try
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde", default = "default_max_retry_delay")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_retry_delay(),
            max_delay: default_max_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_sbatch() -> String {
    "sbatch".to_string()
}

fn default_squeue() -> String {
    "squeue".to_string()
}

fn default_sacct() -> String {
    "sacct".to_string()
}

fn default_scancel() -> String {
    "scancel".to_string()
}

fn default_stale_after() -> Duration {
    Duration::from_secs(600)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_wait_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl EngineConfig {
    /// Read a TOML config file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                config_not_found(path)
            } else {
                SplitflowError::configuration(format!("Cannot read {}", path.display()))
                    .with_source(e)
            }
        })?;

        let mut config: EngineConfig = toml::from_str(&content)
            .map_err(|e| SplitflowError::from(e).with_context(path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SPLITFLOW_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("SPLITFLOW_BACKEND") {
            self.backend = backend.parse()?;
        }

        if let Some(workers) = lookup("SPLITFLOW_WORKERS") {
            let workers: usize = workers.trim().parse().map_err(|_| {
                SplitflowError::configuration_with_code(
                    ErrorCode::CONFIG_INVALID_VALUE,
                    format!("SPLITFLOW_WORKERS must be a positive integer, got '{}'", workers),
                    Some("SPLITFLOW_WORKERS".to_string()),
                )
            })?;
            self.local.workers = workers;
            self.cluster.workers = workers;
        }

        if let Some(args) = lookup("SPLITFLOW_SUBMIT_ARGS") {
            self.batch.submit_args = args;
        }

        if let Some(runtime) = lookup("SPLITFLOW_CONTAINER_RUNTIME") {
            self.container.runtime = runtime.parse()?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |value: usize, field: &str| {
            if value == 0 {
                Err(SplitflowError::configuration_with_code(
                    ErrorCode::CONFIG_INVALID_VALUE,
                    format!("{} must be at least 1", field),
                    Some(field.to_string()),
                ))
            } else {
                Ok(())
            }
        };
        positive(self.local.workers, "local.workers")?;
        positive(self.cluster.workers, "cluster.workers")?;

        let nonzero = |value: Duration, field: &str| {
            if value.is_zero() {
                Err(SplitflowError::configuration_with_code(
                    ErrorCode::CONFIG_INVALID_VALUE,
                    format!("{} must be greater than zero", field),
                    Some(field.to_string()),
                ))
            } else {
                Ok(())
            }
        };
        nonzero(self.batch.poll_interval, "batch.poll_interval")?;
        nonzero(self.cache.heartbeat_interval, "cache.heartbeat_interval")?;
        nonzero(self.cache.wait_poll_interval, "cache.wait_poll_interval")?;

        if self.cache.heartbeat_interval >= self.cache.stale_after {
            return Err(SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "cache.heartbeat_interval must be shorter than cache.stale_after",
                Some("cache.heartbeat_interval".to_string()),
            ));
        }

        if shell_words::split(&self.batch.submit_args).is_err() {
            return Err(SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("batch.submit_args has unbalanced quotes: {}", self.batch.submit_args),
                Some("batch.submit_args".to_string()),
            ));
        }

        Ok(())
    }
}
