//! HPC batch-scheduler backend.
//!
//! Each job becomes a script submitted to the scheduler with the configured
//! resource directives, then polled until it leaves the queue. Only the
//! submission step is retried; a job that ran and failed is reported as an
//! errored result.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::retry::retry_with_backoff;
use super::{Backend, BackendKind, ResultStream};
use crate::config::BatchConfig;
use crate::error::{ErrorCode, Result, SplitflowError};
use crate::execution::{ExecutionResult, Executor, Job, RETURNCODE_FILE};

/// Consecutive unknown states tolerated before giving up on a job
const MAX_UNKNOWN_POLLS: u32 = 5;

pub const SCRIPT_FILE: &str = "job.sh";

/// Everything the scheduler needs to queue one job
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub job_name: String,
    pub script_path: PathBuf,
    pub work_dir: PathBuf,
    /// Opaque resource directives, passed through unmodified
    pub directives: String,
    pub scheduler_log: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Client for an external batch scheduler
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Queue a job and return its scheduler id
    async fn submit(&self, request: &BatchRequest) -> Result<String>;

    async fn status(&self, job_id: &str) -> Result<JobState>;

    async fn cancel(&self, job_id: &str) -> Result<()>;
}

pub struct BatchBackend {
    inner: Arc<BatchInner>,
    tasks: Mutex<JoinSet<()>>,
}

struct BatchInner {
    executor: Executor,
    scheduler: Arc<dyn BatchScheduler>,
    config: BatchConfig,
    active: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BatchBackend {
    pub fn new(executor: Executor, scheduler: Arc<dyn BatchScheduler>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                executor,
                scheduler,
                config,
                active: Mutex::new(HashSet::new()),
                closed: AtomicBool::new(false),
            }),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Scheduler ids of jobs queued or running right now
    pub fn active_jobs(&self) -> Vec<String> {
        locked(&self.inner.active).iter().cloned().collect()
    }
}

impl BatchInner {
    async fn drive(&self, job: Job) -> ExecutionResult {
        let script_path = job.work_dir.join(SCRIPT_FILE);
        if let Err(e) = tokio::fs::write(&script_path, self.executor.render_script(&job)).await {
            return ExecutionResult::errored(
                job.checksum.clone(),
                format!("cannot write job script {}: {}", script_path.display(), e),
            );
        }

        let request = BatchRequest {
            job_name: format!("{}-{}", job.task_name, job.checksum.short()),
            script_path,
            work_dir: job.work_dir.clone(),
            directives: self.config.submit_args.clone(),
            scheduler_log: job.work_dir.join("scheduler.log"),
        };

        let context = format!("batch submission of {}", request.job_name);
        let submitted = retry_with_backoff(
            &self.config.retry,
            &context,
            |_: &SplitflowError| !self.closed.load(Ordering::SeqCst),
            || self.scheduler.submit(&request),
        )
        .await;

        let job_id = match submitted {
            Ok(id) => id,
            Err(e) => {
                let error = SplitflowError::submission_with_code(
                    ErrorCode::SUBMIT_RETRIES_EXHAUSTED,
                    format!("{} gave up", context),
                    Some(BackendKind::BatchScheduler.to_string()),
                )
                .with_source(e);
                return ExecutionResult::errored(job.checksum.clone(), error.to_string());
            }
        };

        info!("Submitted {} as batch job {}", request.job_name, job_id);
        locked(&self.active).insert(job_id.clone());
        let state = self.wait_for_job(&job, &job_id).await;
        locked(&self.active).remove(&job_id);

        match state {
            JobState::Cancelled => ExecutionResult::errored(
                job.checksum.clone(),
                format!("batch job {} was cancelled", job_id),
            ),
            state => {
                let mut result = self.executor.collect(&job).await;
                if result.return_code.is_none() {
                    result.error = Some(format!(
                        "batch job {} ended in state {:?}: {}",
                        job_id,
                        state,
                        result.error.unwrap_or_default()
                    ));
                }
                result
            }
        }
    }

    /// Poll until the job reaches a terminal state, records its return
    /// code, or stays unknown for too long
    async fn wait_for_job(&self, job: &Job, job_id: &str) -> JobState {
        let rc_path = job.work_dir.join(RETURNCODE_FILE);
        let mut unknown = 0;

        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            if tokio::fs::try_exists(&rc_path).await.unwrap_or(false) {
                return JobState::Completed;
            }

            match self.scheduler.status(job_id).await {
                Ok(state) if state.is_terminal() => {
                    debug!("Batch job {} finished as {:?}", job_id, state);
                    return state;
                }
                Ok(JobState::Unknown) => unknown += 1,
                Ok(_) => unknown = 0,
                Err(e) => {
                    warn!("Status check for batch job {} failed: {}", job_id, e);
                    unknown += 1;
                }
            }

            if unknown >= MAX_UNKNOWN_POLLS {
                warn!(
                    "Batch job {} unknown to the scheduler after {} checks",
                    job_id, unknown
                );
                return JobState::Unknown;
            }
        }
    }
}

#[async_trait]
impl Backend for BatchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BatchScheduler
    }

    async fn submit(&self, jobs: Vec<Job>) -> Result<ResultStream> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SplitflowError::submission_with_code(
                ErrorCode::SUBMIT_BACKEND_CLOSED,
                "batch backend has been shut down",
                Some(BackendKind::BatchScheduler.to_string()),
            ));
        }

        let (tx, rx) = mpsc::channel(jobs.len().max(1));
        let mut tasks = locked(&self.tasks);
        while tasks.try_join_next().is_some() {}

        for job in jobs {
            let tx = tx.clone();
            let inner = Arc::clone(&self.inner);
            tasks.spawn(async move {
                let checksum = job.checksum.clone();
                let result = inner.drive(job).await;
                let _ = tx.send((checksum, result)).await;
            });
        }

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Drivers must be gone before `active` is drained, or a driver still
        // mid-poll could record a job id nobody cancels
        let mut drivers = std::mem::take(&mut *locked(&self.tasks));
        drivers.shutdown().await;

        let outstanding: Vec<String> = locked(&self.inner.active).drain().collect();
        let mut failures = Vec::new();
        for job_id in outstanding {
            info!("Cancelling batch job {}", job_id);
            if let Err(e) = self.inner.scheduler.cancel(&job_id).await {
                warn!("Failed to cancel batch job {}: {}", job_id, e);
                failures.push(job_id);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SplitflowError::submission(format!(
                "could not cancel batch job(s): {}",
                failures.join(", ")
            )))
        }
    }
}
