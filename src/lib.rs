//! # splitflow
//!
//! Split a command-line task over its inputs, run every instance once, and
//! cache the results by content.
//!
//! A [`Task`] names an executable, its input bindings, an optional container
//! and an optional split declaration. Dispatching it through a
//! [`Submitter`] expands the split into instances, checksums each one,
//! claims uncached checksums in the [`Cache`], runs them on the configured
//! backend and assembles the results in split order.
//!
//! ## Modules
//!
//! - `split` - Split expansion and combine folding
//! - `task` - Task declaration, bindings and container specs
//! - `cache` - Checksums, leases and committed entries
//! - `execution` - Command resolution, container wrapping and the executor
//! - `backend` - Local pool, batch scheduler and distributed cluster backends
//! - `submitter` - Scoped backend lifecycle and task dispatch
//! - `config` - Engine configuration
//! - `subprocess` - Process runner abstraction with a mock for tests

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod split;
pub mod submitter;
pub mod subprocess;
pub mod task;

pub use backend::BackendKind;
pub use cache::{Cache, Checksum};
pub use config::EngineConfig;
pub use error::{ErrorCode, Result, SplitflowError};
pub use execution::{ExecutionResult, TaskOutput};
pub use split::{CombineSpec, Folded, SplitSpec};
pub use submitter::{Submitter, SubmitterBuilder, TaskHandle};
pub use task::{BindMode, BindMount, ContainerSpec, Input, Task, TaskBuilder, Value};
