use crate::error::{ErrorCode, SplitflowError};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot capture output to {path}: {source}")]
    CaptureFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mock expectation not met: {0}")]
    MockExpectationNotMet(String),
}

impl ProcessError {
    /// Whether the process never started
    pub fn is_start_failure(&self) -> bool {
        matches!(self, Self::CommandNotFound(_) | Self::SpawnFailed { .. })
    }
}

/// Convert ProcessError to SplitflowError
impl From<ProcessError> for SplitflowError {
    fn from(err: ProcessError) -> Self {
        let (code, command) = match &err {
            ProcessError::CommandNotFound(cmd) => {
                (ErrorCode::EXEC_COMMAND_NOT_FOUND, Some(cmd.clone()))
            }
            ProcessError::Timeout(_) => (ErrorCode::EXEC_TIMEOUT, None),
            ProcessError::SpawnFailed { command, .. } => {
                (ErrorCode::EXEC_SPAWN_FAILED, Some(command.clone()))
            }
            ProcessError::CaptureFailed { .. } | ProcessError::Io(_) => {
                (ErrorCode::EXEC_OUTPUT_ERROR, None)
            }
            ProcessError::MockExpectationNotMet(_) => (ErrorCode::EXEC_GENERIC, None),
        };

        SplitflowError::execution_with_code(code, err.to_string(), command).with_source(err)
    }
}
