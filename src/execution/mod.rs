//! Running one concrete instance.

pub mod command;
mod container;
mod executor;
mod result;

pub use container::{ContainerRuntime, CONTAINER_WORK_DIR};
pub use executor::{Executor, RETURNCODE_FILE, STDERR_FILE, STDOUT_FILE};
pub use result::ExecutionResult;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::Checksum;
use crate::split::Folded;
use crate::task::ContainerSpec;

/// Externally visible result of a task: one result per split position,
/// optionally folded by the task's combine declaration
pub type TaskOutput = Folded<ExecutionResult>;

/// One unit of work handed to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub checksum: Checksum,
    pub task_name: String,
    /// First split position resolving to this checksum
    pub ordinal: usize,
    /// Resolved argv, before any container wrapping
    pub command: Vec<String>,
    pub container: Option<ContainerSpec>,
    /// Isolated working directory, also where output is captured
    pub work_dir: PathBuf,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}
