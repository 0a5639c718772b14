use tokio::task::JoinHandle;

use crate::error::{Result, SplitflowError};
use crate::execution::TaskOutput;

/// Pending output of one dispatched task
#[derive(Debug)]
pub struct TaskHandle {
    task_name: String,
    handle: JoinHandle<Result<TaskOutput>>,
}

impl TaskHandle {
    pub(super) fn new(task_name: String, handle: JoinHandle<Result<TaskOutput>>) -> Self {
        Self { task_name, handle }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for every instance and return the output in split order
    pub async fn result(self) -> Result<TaskOutput> {
        match self.handle.await {
            Ok(output) => output,
            Err(e) if e.is_cancelled() => Err(SplitflowError::interrupted(format!(
                "dispatch of {} was cancelled",
                self.task_name
            ))),
            Err(e) => Err(SplitflowError::other(format!(
                "dispatch of {} panicked",
                self.task_name
            ))
            .with_source(e)),
        }
    }
}
