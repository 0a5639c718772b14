//! The declared unit of work.
//!
//! A [`Task`] is built by the caller, either through [`TaskBuilder`] or by
//! deserializing a TOML task file, and stays immutable once dispatched.

pub mod container;
pub(crate) mod plan;
pub mod value;

pub use container::{BindMode, BindMount, ContainerSpec};
pub use value::{Bindings, Scalar, Value, ValueKind};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{Cache, Checksum};
use crate::config::EngineConfig;
use crate::error::{helpers::config_not_found, ErrorCode, Result, SplitflowError};
use crate::execution::TaskOutput;
use crate::split::{self, CombineSpec, Instance, SplitSpec};
use crate::submitter::Submitter;
use plan::DispatchPlan;

/// Reserved binding name for the command itself
pub const EXECUTABLE: &str = "executable";

/// A named input binding with an optional command-line flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "InputRepr")]
pub struct Input {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InputRepr {
    Declared { value: Value, flag: Option<String> },
    Plain(Value),
}

impl From<InputRepr> for Input {
    fn from(repr: InputRepr) -> Self {
        match repr {
            InputRepr::Declared { value, flag } => Input { value, flag },
            InputRepr::Plain(value) => Input { value, flag: None },
        }
    }
}

impl Input {
    pub fn positional(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            flag: None,
        }
    }

    pub fn flagged(flag: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            flag: Some(flag.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub executable: Value,
    #[serde(default)]
    pub inputs: IndexMap<String, Input>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combine: Option<CombineSpec>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

/// Per-user cache directory, falling back to the system temp dir
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "splitflow")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("splitflow-cache"))
}

impl Task {
    pub fn builder(name: impl Into<String>, executable: impl Into<Value>) -> TaskBuilder {
        TaskBuilder::new(name, executable)
    }

    /// Load and validate a task declared in a TOML file
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
        let mut task: Task = toml::from_str(&content)
            .map_err(|e| SplitflowError::from(e).with_context(path.display()))?;

        if task.cache_dir.is_relative() {
            if let Some(parent) = path.parent() {
                task.cache_dir = parent.join(&task.cache_dir);
            }
        }
        task.validate()?;
        Ok(task)
    }

    /// Every binding the splitter sees, `executable` first
    pub fn bindings(&self) -> Bindings {
        std::iter::once((EXECUTABLE.to_string(), self.executable.clone()))
            .chain(
                self.inputs
                    .iter()
                    .map(|(name, input)| (name.clone(), input.value.clone())),
            )
            .collect()
    }

    pub fn is_split(&self) -> bool {
        self.split.is_some()
    }

    /// Check everything that can be checked before execution starts
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_MISSING_FIELD,
                "task name must not be empty",
                Some("name".to_string()),
            ));
        }
        if self.inputs.contains_key(EXECUTABLE) {
            return Err(SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("'{}' is reserved and cannot be an input name", EXECUTABLE),
                Some(EXECUTABLE.to_string()),
            ));
        }
        if let Some(split) = &self.split {
            split.cardinalities(&self.bindings())?;
        }
        if let Some(combine) = &self.combine {
            combine.validate(self.split.as_ref())?;
        }
        Ok(())
    }

    /// Concrete instances in enumeration order
    pub fn instances(&self) -> Result<Vec<Instance>> {
        self.validate()?;
        split::expand(&self.bindings(), self.split.as_ref())
    }

    /// Cache key of every instance, in enumeration order, under the
    /// default engine configuration
    pub fn checksums(&self) -> Result<Vec<Checksum>> {
        self.checksums_under(&EngineConfig::default())
    }

    /// Cache key of every instance as a submitter with `config` computes it
    pub fn checksums_under(&self, config: &EngineConfig) -> Result<Vec<Checksum>> {
        let plan = DispatchPlan::new(self, config.container.runtime)?;
        Ok(plan.slots.into_iter().map(|slot| slot.checksum).collect())
    }

    /// Run directly on an implicit local pool, with the same caching as a
    /// submitter would apply.
    pub async fn run(&self) -> Result<TaskOutput> {
        let task = self.clone();
        Submitter::scope(EngineConfig::default(), move |submitter| async move {
            submitter.run(&task).await
        })
        .await
    }

    /// Read a previously committed run back from the cache.
    ///
    /// Returns `None` unless every instance has a committed entry. Nothing is
    /// executed.
    pub fn result(&self) -> Result<Option<TaskOutput>> {
        self.result_under(&EngineConfig::default())
    }

    /// [`Task::result`] for runs made by a submitter with `config`
    pub fn result_under(&self, config: &EngineConfig) -> Result<Option<TaskOutput>> {
        let plan = DispatchPlan::new(self, config.container.runtime)?;
        let cache = Cache::new(&self.cache_dir, config.cache.clone());

        let mut results = Vec::with_capacity(plan.slots.len());
        for slot in &plan.slots {
            match cache.lookup(&slot.checksum)? {
                Some(entry) => results.push((slot.index.clone(), entry.into_result())),
                None => return Ok(None),
            }
        }

        split::combine::fold(self.split.as_ref(), self.combine.as_ref(), results).map(Some)
    }
}

pub struct TaskBuilder {
    task: Task,
    split: Option<String>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>, executable: impl Into<Value>) -> Self {
        Self {
            task: Task {
                name: name.into(),
                executable: executable.into(),
                inputs: IndexMap::new(),
                container: None,
                split: None,
                combine: None,
                cache_dir: default_cache_dir(),
                timeout: None,
            },
            split: None,
        }
    }

    /// Positional input, rendered as its value only
    pub fn input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.task.inputs.insert(name.into(), Input::positional(value));
        self
    }

    /// Input rendered as `flag value`
    pub fn flag_input(
        mut self,
        name: impl Into<String>,
        flag: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.task.inputs.insert(name.into(), Input::flagged(flag, value));
        self
    }

    pub fn container(mut self, container: ContainerSpec) -> Self {
        self.task.container = Some(container);
        self
    }

    /// Split expression such as `args` or `[(a, b), c]`, parsed at build time
    pub fn split(mut self, expression: impl Into<String>) -> Self {
        self.split = Some(expression.into());
        self
    }

    pub fn split_spec(mut self, split: SplitSpec) -> Self {
        self.task.split = Some(split);
        self.split = None;
        self
    }

    pub fn combine(mut self, combine: CombineSpec) -> Self {
        self.task.combine = Some(combine);
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task.cache_dir = dir.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.task.timeout = Some(timeout);
        self
    }

    pub fn build(mut self) -> Result<Task> {
        if let Some(expression) = self.split.take() {
            self.task.split = Some(SplitSpec::parse(&expression)?);
        }
        self.task.validate()?;
        Ok(self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_orders_executable_first() {
        let task = Task::builder("echo", "echo")
            .input("args", vec!["one", "two"])
            .split("args")
            .build()
            .unwrap();

        let bindings = task.bindings();
        let names: Vec<&String> = bindings.keys().collect();
        assert_eq!(names, vec!["executable", "args"]);
        assert_eq!(task.instances().unwrap().len(), 2);
    }

    #[test]
    fn test_reserved_input_name_rejected() {
        let err = Task::builder("bad", "echo")
            .input("executable", "ls")
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_mismatched_scalar_split_fails_at_build() {
        let err = Task::builder("zip", "echo")
            .input("a", vec![1i64, 2])
            .input("b", vec![1i64])
            .split("(a, b)")
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_SPLIT_LENGTH_MISMATCH);
    }

    #[test]
    fn test_combine_without_split_rejected() {
        let err = Task::builder("c", "echo")
            .input("args", vec!["a"])
            .combine(CombineSpec::new(["args"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_INVALID_COMBINER);
    }

    #[test]
    fn test_load_task_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("task.toml");
        std::fs::write(
            &path,
            r#"
name = "singularity_ls"
executable = ["pwd", "ls", ["echo", "hi"]]
split = "executable"
cache_dir = "cache"
timeout = "30s"

[inputs]
verbose = { value = true, flag = "-v" }
label = "run"

[container]
image = "library/debian:latest"
binds = [{ host = "/data", container = "/BASE", mode = "rw" }]
"#,
        )
        .unwrap();

        let task = Task::load(&path).unwrap();
        assert_eq!(task.name, "singularity_ls");
        assert_eq!(task.cache_dir, temp.path().join("cache"));
        assert_eq!(task.timeout, Some(Duration::from_secs(30)));
        assert_eq!(task.inputs["verbose"].flag.as_deref(), Some("-v"));
        assert_eq!(task.inputs["label"].value, Value::from("run"));
        assert_eq!(task.container.as_ref().unwrap().binds[0].to_string(), "/data:/BASE:rw");
        assert_eq!(task.instances().unwrap().len(), 3);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Task::load("/nonexistent/task.toml").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_NOT_FOUND);
    }

    #[test]
    fn test_result_is_none_before_any_run() {
        let temp = tempfile::TempDir::new().unwrap();
        let task = Task::builder("echo", "echo")
            .input("args", vec!["one", "two"])
            .split("args")
            .cache_dir(temp.path())
            .build()
            .unwrap();
        assert!(task.result().unwrap().is_none());
    }
}
