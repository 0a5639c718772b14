use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use super::error::ProcessError;

/// Where a process writes its stdout and stderr
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputCapture {
    /// Buffered and returned as text on [`ProcessOutput`]
    #[default]
    Piped,
    /// Written byte for byte into two files; [`ProcessOutput`] text stays empty
    Files { stdout: PathBuf, stderr: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub capture: OutputCapture,
}

impl ProcessCommand {
    /// Program and arguments as one display string
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Timeout,
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;
}

pub struct TokioProcessRunner;

impl TokioProcessRunner {
    fn log_command_start(command: &ProcessCommand) {
        tracing::debug!("Executing subprocess: {}", command.display());

        if let Some(ref dir) = command.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }
        if let OutputCapture::Files { stdout, stderr } = &command.capture {
            tracing::trace!("Capturing output to {:?} and {:?}", stdout, stderr);
        }
    }

    fn capture_file(path: &Path) -> Result<Stdio, ProcessError> {
        std::fs::File::create(path)
            .map(Stdio::from)
            .map_err(|source| ProcessError::CaptureFailed {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Build the tokio command with its working directory and output wiring
    fn configure_command(command: &ProcessCommand) -> Result<tokio::process::Command, ProcessError> {
        let mut cmd = tokio::process::Command::new(&command.program);

        // Own process group so a terminal interrupt reaches the engine first
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&command.args);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        match &command.capture {
            OutputCapture::Piped => {
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
            }
            OutputCapture::Files { stdout, stderr } => {
                cmd.stdout(Self::capture_file(stdout)?);
                cmd.stderr(Self::capture_file(stderr)?);
            }
        }

        // A dropped future (cancellation, timeout) must not leave the child behind
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    async fn wait_piped(
        child: tokio::process::Child,
        timeout: Option<Duration>,
    ) -> Result<(std::process::ExitStatus, String, String), ProcessError> {
        let output = match timeout {
            Some(duration) => tokio::time::timeout(duration, child.wait_with_output())
                .await
                .map_err(|_| ProcessError::Timeout(duration))??,
            None => child.wait_with_output().await?,
        };
        Ok((
            output.status,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    async fn wait_captured(
        mut child: tokio::process::Child,
        timeout: Option<Duration>,
    ) -> Result<std::process::ExitStatus, ProcessError> {
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, child.wait()).await {
                Ok(status) => Ok(status?),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill timed out process: {}", e);
                    }
                    Err(ProcessError::Timeout(duration))
                }
            },
            None => Ok(child.wait().await?),
        }
    }

    fn parse_exit_status(status: std::process::ExitStatus) -> ExitStatus {
        if status.success() {
            ExitStatus::Success
        } else if let Some(code) = status.code() {
            ExitStatus::Error(code)
        } else {
            Self::parse_signal_status(status)
        }
    }

    #[cfg(unix)]
    fn parse_signal_status(status: std::process::ExitStatus) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            ExitStatus::Signal(signal)
        } else {
            ExitStatus::Error(1)
        }
    }

    #[cfg(not(unix))]
    fn parse_signal_status(_status: std::process::ExitStatus) -> ExitStatus {
        ExitStatus::Error(1)
    }

    fn log_result(result: &ProcessOutput, command: &ProcessCommand) {
        let command_str = command.display();

        match &result.status {
            ExitStatus::Success => {
                tracing::debug!(
                    "Subprocess completed in {:?}: {}",
                    result.duration,
                    command_str
                );
            }
            ExitStatus::Error(code) => {
                tracing::debug!(
                    "Subprocess exited with {} in {:?}: {}",
                    code,
                    result.duration,
                    command_str
                );
                if !result.stderr.is_empty() {
                    tracing::trace!("Stderr: {}", result.stderr);
                }
            }
            ExitStatus::Signal(signal) => {
                tracing::warn!(
                    "Subprocess terminated by signal {} in {:?}: {}",
                    signal,
                    result.duration,
                    command_str
                );
            }
            ExitStatus::Timeout => {
                tracing::warn!("Subprocess timed out: {}", command_str);
            }
        }
    }

    fn map_spawn_error(error: std::io::Error, command: &ProcessCommand) -> ProcessError {
        if error.kind() == std::io::ErrorKind::NotFound {
            ProcessError::CommandNotFound(command.program.clone())
        } else {
            tracing::error!("Failed to spawn '{}': {}", command.program, error);
            ProcessError::SpawnFailed {
                command: command.display(),
                source: error,
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let start = std::time::Instant::now();
        Self::log_command_start(&command);

        let mut cmd = Self::configure_command(&command)?;
        let child = cmd
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, &command))?;
        // The parent's copies of capture file handles close with `cmd`
        drop(cmd);

        let (status, stdout, stderr) = match &command.capture {
            OutputCapture::Piped => Self::wait_piped(child, command.timeout).await?,
            OutputCapture::Files { .. } => (
                Self::wait_captured(child, command.timeout).await?,
                String::new(),
                String::new(),
            ),
        };

        let result = ProcessOutput {
            status: Self::parse_exit_status(status),
            stdout,
            stderr,
            duration: start.elapsed(),
        };
        Self::log_result(&result, &command);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_exit_status() {
        use std::os::unix::process::ExitStatusExt;

        let status = std::process::ExitStatus::from_raw(0);
        assert_eq!(
            TokioProcessRunner::parse_exit_status(status),
            ExitStatus::Success
        );

        // Exit code 1
        let status = std::process::ExitStatus::from_raw(256);
        assert_eq!(
            TokioProcessRunner::parse_exit_status(status),
            ExitStatus::Error(1)
        );

        // Killed by SIGKILL
        let status = std::process::ExitStatus::from_raw(9);
        assert_eq!(
            TokioProcessRunner::parse_exit_status(status),
            ExitStatus::Signal(9)
        );
    }

    #[test]
    fn test_capture_file_in_missing_dir_fails() {
        let command = ProcessCommand {
            program: "echo".to_string(),
            args: vec![],
            working_dir: None,
            timeout: None,
            capture: OutputCapture::Files {
                stdout: PathBuf::from("/nonexistent/dir/stdout.txt"),
                stderr: PathBuf::from("/nonexistent/dir/stderr.txt"),
            },
        };
        assert!(matches!(
            TokioProcessRunner::configure_command(&command),
            Err(ProcessError::CaptureFailed { .. })
        ));
    }
}
