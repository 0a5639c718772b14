//! Distributed-cluster backend.
//!
//! Jobs are handed to a cluster client as work units and come back as
//! futures. The bundled [`LocalCluster`] runs a fixed set of in-process
//! workers; remote clients implement [`ClusterClient`] themselves.

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::retry::retry_with_backoff;
use super::{Backend, BackendKind, ResultStream};
use crate::cache::Checksum;
use crate::config::RetryPolicy;
use crate::error::{ErrorCode, Result, SplitflowError};
use crate::execution::{ExecutionResult, Executor, Job};

/// A job as shipped to a cluster worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub job: Job,
}

/// Eventual result of a submitted work unit
pub type RemoteFuture = BoxFuture<'static, Result<ExecutionResult>>;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Where the cluster scheduler lives, for logging
    fn address(&self) -> String;

    async fn submit(&self, unit: WorkUnit) -> Result<RemoteFuture>;

    /// Stop accepting work and cancel what is outstanding
    async fn close(&self) -> Result<()>;
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn closed_error() -> SplitflowError {
    SplitflowError::submission_with_code(
        ErrorCode::SUBMIT_BACKEND_CLOSED,
        "cluster client has been closed",
        Some(BackendKind::DistributedCluster.to_string()),
    )
}

type Assignment = (Job, oneshot::Sender<ExecutionResult>);

/// In-process cluster: a shared queue drained by a fixed number of workers
pub struct LocalCluster {
    address: String,
    queue: Mutex<Option<mpsc::UnboundedSender<Assignment>>>,
    workers: Mutex<JoinSet<()>>,
}

impl LocalCluster {
    /// Spawn `workers` worker tasks. Must be called inside a Tokio runtime.
    pub fn start(executor: Executor, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Assignment>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut set = JoinSet::new();

        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let executor = executor.clone();
            set.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((job, reply)) = next else {
                        break;
                    };
                    debug!("Cluster worker {} took instance {} of {}", worker, job.ordinal, job.task_name);
                    let result = executor.run(&job).await;
                    let _ = reply.send(result);
                }
            });
        }

        let address = format!("inproc://{}", Uuid::new_v4());
        info!("Started local cluster at {} with {} worker(s)", address, workers.max(1));
        Self {
            address,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(set),
        }
    }
}

#[async_trait]
impl ClusterClient for LocalCluster {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn submit(&self, unit: WorkUnit) -> Result<RemoteFuture> {
        let (reply, receiver) = oneshot::channel();
        {
            let queue = locked(&self.queue);
            let sender = queue.as_ref().ok_or_else(closed_error)?;
            sender.send((unit.job, reply)).map_err(|_| closed_error())?;
        }

        Ok(async move {
            receiver.await.map_err(|_| {
                SplitflowError::submission("cluster worker went away before finishing the job")
            })
        }
        .boxed())
    }

    async fn close(&self) -> Result<()> {
        locked(&self.queue).take();
        locked(&self.workers).abort_all();
        Ok(())
    }
}

pub struct ClusterBackend {
    client: Arc<dyn ClusterClient>,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl ClusterBackend {
    pub fn new(client: Arc<dyn ClusterClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            closed: AtomicBool::new(false),
        }
    }

    async fn submit_unit(&self, job: Job) -> BoxFuture<'static, (Checksum, ExecutionResult)> {
        let checksum = job.checksum.clone();
        let context = format!("cluster submission of {}", checksum.short());
        let submitted = retry_with_backoff(
            &self.retry,
            &context,
            |_: &SplitflowError| !self.closed.load(Ordering::SeqCst),
            || self.client.submit(WorkUnit { job: job.clone() }),
        )
        .await;

        match submitted {
            Ok(remote) => async move {
                let result = remote.await.unwrap_or_else(|e| {
                    warn!("Cluster job {} failed: {}", checksum.short(), e);
                    ExecutionResult::errored(checksum.clone(), e.to_string())
                });
                (checksum, result)
            }
            .boxed(),
            Err(e) => {
                let error = SplitflowError::submission_with_code(
                    ErrorCode::SUBMIT_RETRIES_EXHAUSTED,
                    format!("{} gave up", context),
                    Some(BackendKind::DistributedCluster.to_string()),
                )
                .with_source(e);
                let result = ExecutionResult::errored(checksum.clone(), error.to_string());
                future::ready((checksum, result)).boxed()
            }
        }
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DistributedCluster
    }

    async fn submit(&self, jobs: Vec<Job>) -> Result<ResultStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }

        debug!("Submitting {} job(s) to {}", jobs.len(), self.client.address());
        let mut units = Vec::with_capacity(jobs.len());
        for job in jobs {
            units.push(self.submit_unit(job).await);
        }
        Ok(Box::pin(units.into_iter().collect::<FuturesUnordered<_>>()))
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing cluster client at {}", self.client.address());
        self.client.close().await
    }
}
