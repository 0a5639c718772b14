use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{ErrorCode, SplitflowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Ro,
    Rw,
}

impl fmt::Display for BindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindMode::Ro => f.write_str("ro"),
            BindMode::Rw => f.write_str("rw"),
        }
    }
}

impl FromStr for BindMode {
    type Err = SplitflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ro" => Ok(BindMode::Ro),
            "rw" => Ok(BindMode::Rw),
            other => Err(SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("bind mode must be 'ro' or 'rw', got '{}'", other),
                Some("mode".to_string()),
            )),
        }
    }
}

/// One host → container bind mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: PathBuf,
    pub mode: BindMode,
}

impl BindMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>, mode: BindMode) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode,
        }
    }
}

/// Renders as `host:container:mode`, the form container runtimes accept
impl fmt::Display for BindMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.host.display(),
            self.container.display(),
            self.mode
        )
    }
}

impl FromStr for BindMount {
    type Err = SplitflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [host, container] if !host.is_empty() && !container.is_empty() => {
                Ok(BindMount::new(*host, *container, BindMode::Rw))
            }
            [host, container, mode] if !host.is_empty() && !container.is_empty() => {
                Ok(BindMount::new(*host, *container, mode.parse()?))
            }
            _ => Err(SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("bind mount must look like host:container[:mode], got '{}'", s),
                Some("binds".to_string()),
            )),
        }
    }
}

/// Image plus bind mounts for running a task inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub binds: Vec<BindMount>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            binds: Vec::new(),
        }
    }

    pub fn bind(
        mut self,
        host: impl Into<PathBuf>,
        container: impl Into<PathBuf>,
        mode: BindMode,
    ) -> Self {
        self.binds.push(BindMount::new(host, container, mode));
        self
    }
}
