//! Wrapping a command in a container runtime invocation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ErrorCode, SplitflowError};
use crate::task::{BindMode, BindMount, ContainerSpec};

/// Where the instance working directory appears inside the container
pub const CONTAINER_WORK_DIR: &str = "/output_dir";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Singularity,
    Docker,
}

impl ContainerRuntime {
    pub fn default_binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Singularity => "singularity",
            ContainerRuntime::Docker => "docker",
        }
    }

    /// Arguments for `<binary> ...` running `inner` inside `spec.image`.
    ///
    /// Declared binds come first in order, then the working directory bound
    /// read-write at [`CONTAINER_WORK_DIR`], which is also the working
    /// directory of the inner command.
    pub fn wrap(&self, spec: &ContainerSpec, work_dir: &Path, inner: &[String]) -> Vec<String> {
        let work_bind = BindMount::new(work_dir, CONTAINER_WORK_DIR, BindMode::Rw);
        let binds = spec.binds.iter().chain(std::iter::once(&work_bind));

        let mut args = Vec::with_capacity(inner.len() + spec.binds.len() * 2 + 6);
        match self {
            ContainerRuntime::Singularity => {
                args.push("exec".to_string());
                for bind in binds {
                    args.push("-B".to_string());
                    args.push(bind.to_string());
                }
                args.push("--pwd".to_string());
                args.push(CONTAINER_WORK_DIR.to_string());
            }
            ContainerRuntime::Docker => {
                args.push("run".to_string());
                args.push("--rm".to_string());
                for bind in binds {
                    args.push("-v".to_string());
                    args.push(bind.to_string());
                }
                args.push("-w".to_string());
                args.push(CONTAINER_WORK_DIR.to_string());
            }
        }
        args.push(spec.image.clone());
        args.extend(inner.iter().cloned());
        args
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_binary())
    }
}

impl FromStr for ContainerRuntime {
    type Err = SplitflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "singularity" | "apptainer" => Ok(ContainerRuntime::Singularity),
            "docker" => Ok(ContainerRuntime::Docker),
            other => Err(SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("unknown container runtime '{}'", other),
                Some("container.runtime".to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec::new("/images/debian.sif")
            .bind("/data", "/BASE", BindMode::Rw)
            .bind("/refs", "/refs", BindMode::Ro)
    }

    #[test]
    fn test_singularity_invocation() {
        let args = ContainerRuntime::Singularity.wrap(
            &spec(),
            Path::new("/cache/.work/abc"),
            &["ls".to_string()],
        );
        assert_eq!(
            args,
            vec![
                "exec",
                "-B",
                "/data:/BASE:rw",
                "-B",
                "/refs:/refs:ro",
                "-B",
                "/cache/.work/abc:/output_dir:rw",
                "--pwd",
                "/output_dir",
                "/images/debian.sif",
                "ls"
            ]
        );
    }

    #[test]
    fn test_docker_invocation() {
        let args = ContainerRuntime::Docker.wrap(
            &ContainerSpec::new("debian:bookworm").bind("/data", "/BASE", BindMode::Rw),
            Path::new("/w"),
            &["echo".to_string(), "hi".to_string()],
        );
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "-v",
                "/data:/BASE:rw",
                "-v",
                "/w:/output_dir:rw",
                "-w",
                "/output_dir",
                "debian:bookworm",
                "echo",
                "hi"
            ]
        );
    }

    #[test]
    fn test_runtime_parsing() {
        assert_eq!("Docker".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Docker);
        assert_eq!(
            "apptainer".parse::<ContainerRuntime>().unwrap(),
            ContainerRuntime::Singularity
        );
        assert!("podman".parse::<ContainerRuntime>().is_err());
    }
}
