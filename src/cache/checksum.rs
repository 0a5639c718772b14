//! Content hash identifying one instance's execution.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::Result;
use crate::execution::ContainerRuntime;
use crate::split::Instance;
use crate::task::{ContainerSpec, Task, Value};

/// Bumped whenever the hashed layout changes, which invalidates old entries
const CHECKSUM_VERSION: u32 = 1;

/// Hex-encoded SHA-256 of an instance's execution identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

#[derive(Serialize)]
struct Identity<'a> {
    version: u32,
    bindings: Vec<(&'a str, Option<&'a str>, &'a Value)>,
    container: Option<&'a ContainerSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime: Option<ContainerRuntime>,
}

impl Checksum {
    /// Hash the executable, resolved bindings (with their flags), the
    /// container spec and, for container tasks, the runtime that will run
    /// it. Task name, cache directory, timeout and the runtime binary path
    /// are excluded.
    pub fn of_instance(task: &Task, instance: &Instance, runtime: ContainerRuntime) -> Result<Self> {
        let bindings = instance
            .bindings
            .iter()
            .map(|(name, value)| {
                let flag = task
                    .inputs
                    .get(name)
                    .and_then(|input| input.flag.as_deref());
                (name.as_str(), flag, value)
            })
            .collect();

        let identity = Identity {
            version: CHECKSUM_VERSION,
            bindings,
            container: task.container.as_ref(),
            runtime: task.container.as_ref().map(|_| runtime),
        };

        Ok(Self::of_bytes(&serde_json::to_vec(&identity)?))
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::BindMode;

    fn checksums(task: &Task) -> Vec<Checksum> {
        task.instances()
            .unwrap()
            .iter()
            .map(|i| Checksum::of_instance(task, i, ContainerRuntime::Singularity).unwrap())
            .collect()
    }

    #[test]
    fn test_checksum_ignores_name_and_cache_dir() {
        let a = Task::builder("first", "echo")
            .input("args", "one")
            .cache_dir("/tmp/a")
            .build()
            .unwrap();
        let b = Task::builder("second", "echo")
            .input("args", "one")
            .cache_dir("/tmp/b")
            .build()
            .unwrap();

        assert_eq!(checksums(&a), checksums(&b));
        assert_eq!(checksums(&a)[0].as_str().len(), 64);
    }

    #[test]
    fn test_container_runtime_changes_checksum() {
        let contained = Task::builder("t", "ls")
            .container(ContainerSpec::new("library/debian:latest"))
            .build()
            .unwrap();
        let plain = Task::builder("t", "ls").build().unwrap();

        let key = |task: &Task, runtime| {
            Checksum::of_instance(task, &task.instances().unwrap()[0], runtime).unwrap()
        };
        assert_ne!(
            key(&contained, ContainerRuntime::Singularity),
            key(&contained, ContainerRuntime::Docker)
        );
        assert_eq!(
            key(&plain, ContainerRuntime::Singularity),
            key(&plain, ContainerRuntime::Docker)
        );
    }

    #[test]
    fn test_split_instance_matches_unsplit_task() {
        let split = Task::builder("split", "echo")
            .input("args", vec!["one", "two"])
            .split("args")
            .build()
            .unwrap();
        let single = Task::builder("single", "echo")
            .input("args", "two")
            .build()
            .unwrap();

        assert_eq!(checksums(&split)[1], checksums(&single)[0]);
    }

    #[test]
    fn test_checksum_sensitive_to_execution_fields() {
        let base = Task::builder("t", "echo").input("args", "one").build().unwrap();
        let other_value = Task::builder("t", "echo").input("args", "two").build().unwrap();
        let flagged = Task::builder("t", "echo")
            .flag_input("args", "-n", "one")
            .build()
            .unwrap();
        let contained = Task::builder("t", "echo")
            .input("args", "one")
            .container(ContainerSpec::new("debian.sif").bind("/data", "/BASE", BindMode::Rw))
            .build()
            .unwrap();
        let other_bind = Task::builder("t", "echo")
            .input("args", "one")
            .container(ContainerSpec::new("debian.sif").bind("/data", "/BASE", BindMode::Ro))
            .build()
            .unwrap();

        let all = [
            checksums(&base)[0].clone(),
            checksums(&other_value)[0].clone(),
            checksums(&flagged)[0].clone(),
            checksums(&contained)[0].clone(),
            checksums(&other_bind)[0].clone(),
        ];
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
    }
}
