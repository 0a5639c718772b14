//! Pluggable execution backends.
//!
//! Every backend takes a batch of jobs and yields `(Checksum, Result)` pairs
//! in completion order. The submitter and cache never know which one is
//! active.

pub mod batch;
pub mod cluster;
pub mod local;
pub mod retry;
pub mod slurm;

pub use batch::{BatchBackend, BatchRequest, BatchScheduler, JobState};
pub use cluster::{ClusterBackend, ClusterClient, LocalCluster, RemoteFuture, WorkUnit};
pub use local::LocalPoolBackend;
pub use retry::retry_with_backoff;
pub use slurm::SlurmScheduler;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use crate::cache::Checksum;
use crate::config::EngineConfig;
use crate::error::{ErrorCode, Result, SplitflowError};
use crate::execution::{ExecutionResult, Executor, Job};

/// Results in completion order
pub type ResultStream = Pin<Box<dyn Stream<Item = (Checksum, ExecutionResult)> + Send>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    #[serde(alias = "cf", alias = "local")]
    LocalPool,
    #[serde(alias = "slurm", alias = "batch")]
    BatchScheduler,
    #[serde(alias = "dask", alias = "cluster")]
    DistributedCluster,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LocalPool => "local-pool",
            BackendKind::BatchScheduler => "batch-scheduler",
            BackendKind::DistributedCluster => "distributed-cluster",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SplitflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local-pool" | "local" | "cf" => Ok(BackendKind::LocalPool),
            "batch-scheduler" | "batch" | "slurm" => Ok(BackendKind::BatchScheduler),
            "distributed-cluster" | "cluster" | "dask" => Ok(BackendKind::DistributedCluster),
            other => Err(SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_UNKNOWN_BACKEND,
                format!(
                    "unknown backend '{}'; expected local-pool, batch-scheduler or distributed-cluster",
                    other
                ),
                Some("backend".to_string()),
            )),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start every job and stream their results as they complete
    async fn submit(&self, jobs: Vec<Job>) -> Result<ResultStream>;

    /// Cancel outstanding work and release resources. Idempotent.
    async fn shutdown(&self) -> Result<()>;
}

/// Externally provided collaborators; defaults are used for anything unset
#[derive(Default, Clone)]
pub struct BackendOverrides {
    pub scheduler: Option<Arc<dyn BatchScheduler>>,
    pub cluster: Option<Arc<dyn ClusterClient>>,
}

/// Construct the backend selected by `config.backend`
pub fn create_backend(
    config: &EngineConfig,
    executor: Executor,
    overrides: BackendOverrides,
) -> Result<Arc<dyn Backend>> {
    config.validate()?;
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::LocalPool => Arc::new(LocalPoolBackend::new(executor, config.local.workers)),
        BackendKind::BatchScheduler => {
            let scheduler = overrides.scheduler.unwrap_or_else(|| {
                Arc::new(SlurmScheduler::new(executor.runner(), config.batch.clone()))
            });
            Arc::new(BatchBackend::new(executor, scheduler, config.batch.clone()))
        }
        BackendKind::DistributedCluster => {
            let client = overrides.cluster.unwrap_or_else(|| {
                Arc::new(LocalCluster::start(executor.clone(), config.cluster.workers))
            });
            Arc::new(ClusterBackend::new(client, config.cluster.retry.clone()))
        }
    };
    tracing::debug!("Created {} backend", backend.kind());
    Ok(backend)
}
