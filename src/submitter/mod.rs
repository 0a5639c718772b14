//! Scoped access to a backend and the dispatch of tasks through it.
//!
//! ```no_run
//! # use splitflow::{EngineConfig, Submitter, Task};
//! # async fn example() -> splitflow::Result<()> {
//! let task = Task::builder("echo", "echo")
//!     .input("args", vec!["one", "two", "three"])
//!     .split("args")
//!     .build()?;
//!
//! let output = Submitter::scope(EngineConfig::default(), |submitter| async move {
//!     submitter.run(&task).await
//! })
//! .await?;
//! assert_eq!(output.len(), 3);
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod handle;

pub use handle::TaskHandle;

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    create_backend, Backend, BackendKind, BackendOverrides, BatchScheduler, ClusterClient,
};
use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::error::{ErrorCode, Result, SplitflowError};
use crate::execution::{Executor, TaskOutput};
use crate::subprocess::{ProcessRunner, TokioProcessRunner};
use crate::task::plan::DispatchPlan;
use crate::task::Task;

/// Cheap to clone; all clones share one backend
#[derive(Clone)]
pub struct Submitter {
    inner: Arc<SubmitterInner>,
}

struct SubmitterInner {
    config: EngineConfig,
    backend: Arc<dyn Backend>,
    drivers: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("backend", &self.inner.backend.kind())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Submitter {
    pub fn builder(config: EngineConfig) -> SubmitterBuilder {
        SubmitterBuilder::new(config)
    }

    /// Open a submitter with the production process runner
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::builder(config).open().await
    }

    /// Run `body` with an open submitter and close it afterwards, whatever
    /// the outcome. Ctrl-C ends the scope with an interrupted error; a panic
    /// in `body` is resumed once the backend is closed.
    pub async fn scope<F, Fut, T>(config: EngineConfig, body: F) -> Result<T>
    where
        F: FnOnce(Submitter) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        Self::builder(config).scope(body).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Start a task and return a handle to its eventual output.
    ///
    /// Configuration problems (split, combine, command) are reported here,
    /// before anything is claimed or executed.
    pub fn dispatch(&self, task: &Task) -> Result<TaskHandle> {
        if self.is_closed() {
            return Err(SplitflowError::submission_with_code(
                ErrorCode::SUBMIT_BACKEND_CLOSED,
                format!("cannot dispatch {}: submitter is closed", task.name),
                Some(self.backend_kind().to_string()),
            ));
        }

        task.validate()?;
        let plan = DispatchPlan::new(task, self.inner.config.container.runtime)?;
        let cache = Cache::new(&task.cache_dir, self.inner.config.cache.clone());
        info!(
            "Dispatching {} ({} instance(s), {} unique) to {}",
            task.name,
            plan.slots.len(),
            plan.jobs.len(),
            self.backend_kind()
        );

        let handle = tokio::spawn(dispatch::drive(plan, cache, Arc::clone(&self.inner.backend)));

        let mut drivers = locked(&self.inner.drivers);
        drivers.retain(|driver| !driver.is_finished());
        drivers.push(handle.abort_handle());

        Ok(TaskHandle::new(task.name.clone(), handle))
    }

    /// Dispatch and wait for the output
    pub async fn run(&self, task: &Task) -> Result<TaskOutput> {
        self.dispatch(task)?.result().await
    }

    /// Cancel unfinished dispatches and shut the backend down. Idempotent.
    ///
    /// Leases held by cancelled dispatches are released; nothing partial is
    /// committed.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drivers: Vec<AbortHandle> = locked(&self.inner.drivers).drain(..).collect();
        let unfinished = drivers.iter().filter(|d| !d.is_finished()).count();
        if unfinished > 0 {
            info!("Cancelling {} unfinished dispatch(es)", unfinished);
        }
        for driver in drivers {
            driver.abort();
        }

        debug!("Shutting down {} backend", self.backend_kind());
        self.inner.backend.shutdown().await
    }
}

/// Collaborators and settings for a [`Submitter`]
pub struct SubmitterBuilder {
    config: EngineConfig,
    runner: Arc<dyn ProcessRunner>,
    overrides: BackendOverrides,
}

impl SubmitterBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            runner: Arc::new(TokioProcessRunner),
            overrides: BackendOverrides::default(),
        }
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = kind;
        self
    }

    /// Process runner for every executor, e.g. a `MockProcessRunner` in tests
    pub fn runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Scheduler client for the batch backend, instead of Slurm
    pub fn batch_scheduler(mut self, scheduler: Arc<dyn BatchScheduler>) -> Self {
        self.overrides.scheduler = Some(scheduler);
        self
    }

    /// Cluster client for the distributed backend, instead of a local cluster
    pub fn cluster_client(mut self, client: Arc<dyn ClusterClient>) -> Self {
        self.overrides.cluster = Some(client);
        self
    }

    pub async fn open(self) -> Result<Submitter> {
        let executor = Executor::new(self.runner, self.config.container.clone());
        let backend = create_backend(&self.config, executor, self.overrides)?;
        info!("Opened submitter on {} backend", backend.kind());

        Ok(Submitter {
            inner: Arc::new(SubmitterInner {
                config: self.config,
                backend,
                drivers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// See [`Submitter::scope`]
    pub async fn scope<F, Fut, T>(self, body: F) -> Result<T>
    where
        F: FnOnce(Submitter) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let submitter = self.open().await?;

        // A panicking body still gets its backend closed before unwinding on
        let guarded = AssertUnwindSafe(body(submitter.clone())).catch_unwind();
        let outcome = tokio::select! {
            result = guarded => result,
            Ok(()) = tokio::signal::ctrl_c() => {
                warn!("Interrupted; closing {} backend", submitter.backend_kind());
                Ok(Err(SplitflowError::interrupted("dispatch interrupted")))
            }
        };

        if let Err(e) = submitter.close().await {
            warn!("Backend teardown failed: {}", e);
        }
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
