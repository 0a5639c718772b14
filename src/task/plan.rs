use indexmap::IndexMap;
use std::path::PathBuf;
use std::time::Duration;

use super::{Task, EXECUTABLE};
use crate::cache::Checksum;
use crate::error::Result;
use crate::execution::{command, ContainerRuntime, Job};
use crate::split::{self, CombineSpec, SplitSpec};
use crate::task::ContainerSpec;

/// One split position and the cache key it resolves to
#[derive(Debug, Clone)]
pub(crate) struct PlanSlot {
    pub index: Vec<usize>,
    pub checksum: Checksum,
}

/// Work needed for one unique checksum
#[derive(Debug, Clone)]
pub(crate) struct PlannedJob {
    pub ordinal: usize,
    pub command: Vec<String>,
}

/// Everything dispatch needs, computed up front so that configuration
/// problems surface before anything runs.
#[derive(Debug, Clone)]
pub(crate) struct DispatchPlan {
    pub task_name: String,
    pub slots: Vec<PlanSlot>,
    pub jobs: IndexMap<Checksum, PlannedJob>,
    pub split: Option<SplitSpec>,
    pub combine: Option<CombineSpec>,
    container: Option<ContainerSpec>,
    timeout: Option<Duration>,
}

impl DispatchPlan {
    pub fn new(task: &Task, runtime: ContainerRuntime) -> Result<Self> {
        let instances = task.instances()?;
        let mut slots = Vec::with_capacity(instances.len());
        let mut jobs: IndexMap<Checksum, PlannedJob> = IndexMap::new();

        for instance in &instances {
            let checksum = Checksum::of_instance(task, instance, runtime)?;

            if !jobs.contains_key(&checksum) {
                let executable = instance
                    .bindings
                    .get(EXECUTABLE)
                    .unwrap_or(&task.executable);
                let arguments = task.inputs.iter().filter_map(|(name, input)| {
                    instance
                        .bindings
                        .get(name)
                        .map(|value| (value, input.flag.as_deref()))
                });
                let argv = command::resolve(executable, arguments)?;

                jobs.insert(
                    checksum.clone(),
                    PlannedJob {
                        ordinal: instance.ordinal,
                        command: argv,
                    },
                );
            } else {
                tracing::debug!(
                    "Instance {} of {} shares checksum {} with an earlier instance",
                    instance.ordinal,
                    task.name,
                    checksum.short()
                );
            }

            slots.push(PlanSlot {
                index: instance.index.clone(),
                checksum,
            });
        }

        Ok(Self {
            task_name: task.name.clone(),
            slots,
            jobs,
            split: task.split.clone(),
            combine: task.combine.clone(),
            container: task.container.clone(),
            timeout: task.timeout,
        })
    }

    /// Materialize the job for `checksum` in the given working directory
    pub fn job(&self, checksum: &Checksum, work_dir: PathBuf) -> Option<Job> {
        self.jobs.get(checksum).map(|planned| Job {
            checksum: checksum.clone(),
            task_name: self.task_name.clone(),
            ordinal: planned.ordinal,
            command: planned.command.clone(),
            container: self.container.clone(),
            work_dir,
            timeout: self.timeout,
        })
    }

    pub fn unique_checksums(&self) -> impl Iterator<Item = &Checksum> {
        self.jobs.keys()
    }

    /// Fold per-slot values, given in slot order, into the task's shape
    pub fn fold<T>(&self, values: Vec<T>) -> Result<split::Folded<T>> {
        let items = self
            .slots
            .iter()
            .zip(values)
            .map(|(slot, value)| (slot.index.clone(), value))
            .collect();
        split::combine::fold(self.split.as_ref(), self.combine.as_ref(), items)
    }
}
