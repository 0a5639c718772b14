//! Bounded pool of local worker tasks.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{Backend, BackendKind, ResultStream};
use crate::error::{ErrorCode, Result, SplitflowError};
use crate::execution::{ExecutionResult, Executor, Job};

/// Runs jobs concurrently on this host, at most `workers` at a time
pub struct LocalPoolBackend {
    executor: Executor,
    workers: usize,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl LocalPoolBackend {
    pub fn new(executor: Executor, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            executor,
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Backend for LocalPoolBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalPool
    }

    async fn submit(&self, jobs: Vec<Job>) -> Result<ResultStream> {
        if self.semaphore.is_closed() {
            return Err(SplitflowError::submission_with_code(
                ErrorCode::SUBMIT_BACKEND_CLOSED,
                "local pool has been shut down",
                Some(BackendKind::LocalPool.to_string()),
            ));
        }

        // One slot per job, so workers never wait on the consumer
        let (tx, rx) = mpsc::channel(jobs.len().max(1));
        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}

        debug!("Local pool accepting {} job(s)", jobs.len());
        for job in jobs {
            let tx = tx.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let executor = self.executor.clone();

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => executor.run(&job).await,
                    Err(_) => ExecutionResult::errored(
                        job.checksum.clone(),
                        "local pool shut down before the job started",
                    ),
                };
                let _ = tx.send((job.checksum, result)).await;
            });
        }

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn shutdown(&self) -> Result<()> {
        self.semaphore.close();
        let mut tasks = self.tasks();
        if !tasks.is_empty() {
            debug!("Aborting {} local worker task(s)", tasks.len());
        }
        tasks.abort_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Checksum;
    use crate::config::ContainerConfig;
    use crate::subprocess::TokioProcessRunner;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn job(dir: &Path, name: &str, command: &[&str]) -> Job {
        let work_dir = dir.join(name);
        std::fs::create_dir_all(&work_dir).unwrap();
        Job {
            checksum: Checksum::of_bytes(name.as_bytes()),
            task_name: "pool".to_string(),
            ordinal: 0,
            command: command.iter().map(|s| s.to_string()).collect(),
            container: None,
            work_dir,
            timeout: None,
        }
    }

    fn backend(workers: usize) -> LocalPoolBackend {
        LocalPoolBackend::new(
            Executor::new(Arc::new(TokioProcessRunner), ContainerConfig::default()),
            workers,
        )
    }

    #[tokio::test]
    async fn test_all_results_arrive() {
        let temp = TempDir::new().unwrap();
        let jobs: Vec<Job> = ["one", "two", "three"]
            .iter()
            .map(|word| job(temp.path(), word, &["echo", *word]))
            .collect();
        let expected: HashMap<Checksum, String> = jobs
            .iter()
            .map(|j| (j.checksum.clone(), j.command[1].clone()))
            .collect();

        let pool = backend(2);
        let results: Vec<_> = pool.submit(jobs).await.unwrap().collect().await;

        assert_eq!(results.len(), 3);
        for (checksum, result) in results {
            assert_eq!(result.stdout(), Some(expected[&checksum].as_str()));
        }
    }

    #[tokio::test]
    async fn test_workers_run_concurrently() {
        let temp = TempDir::new().unwrap();
        let jobs: Vec<Job> = (0..4)
            .map(|i| job(temp.path(), &format!("sleep{}", i), &["sleep", "0.3"]))
            .collect();

        let started = Instant::now();
        let results: Vec<_> = backend(4).submit(jobs).await.unwrap().collect().await;

        assert_eq!(results.len(), 4);
        assert!(started.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_siblings() {
        let temp = TempDir::new().unwrap();
        let jobs = vec![
            job(temp.path(), "ok", &["echo", "fine"]),
            job(temp.path(), "bad", &["false"]),
        ];

        let results: Vec<_> = backend(2).submit(jobs).await.unwrap().collect().await;
        let errored = results.iter().filter(|(_, r)| r.errored).count();
        assert_eq!(results.len(), 2);
        assert_eq!(errored, 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let pool = backend(1);
        pool.shutdown().await.unwrap();
        let err = pool.submit(Vec::new()).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::SUBMIT_BACKEND_CLOSED);
    }

    #[tokio::test]
    async fn test_shutdown_ends_stream() {
        let temp = TempDir::new().unwrap();
        let pool = backend(1);
        let mut stream = pool
            .submit(vec![job(temp.path(), "long", &["sleep", "30"])])
            .await
            .unwrap();

        pool.shutdown().await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
