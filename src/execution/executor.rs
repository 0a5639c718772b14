use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::{ExecutionResult, Job};
use crate::config::ContainerConfig;
use crate::error::SplitflowError;
use crate::subprocess::{ExitStatus, ProcessCommand, ProcessCommandBuilder, ProcessRunner};

pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const RETURNCODE_FILE: &str = "returncode.txt";

/// Runs one job, optionally inside a container, and captures its output
/// into the job's working directory.
///
/// Failures of the job itself never surface as `Err`; they become errored
/// results so sibling instances are unaffected.
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn ProcessRunner>,
    container: ContainerConfig,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(runner: Arc<dyn ProcessRunner>, container: ContainerConfig) -> Self {
        Self { runner, container }
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }

    /// Final argv, container wrapping included
    pub fn argv(&self, job: &Job) -> Vec<String> {
        match &job.container {
            Some(spec) => {
                let mut argv = vec![self.container.binary()];
                argv.extend(self.container.runtime.wrap(spec, &job.work_dir, &job.command));
                argv
            }
            None => job.command.clone(),
        }
    }

    pub fn process_command(&self, job: &Job) -> ProcessCommand {
        let mut argv = self.argv(job).into_iter();
        let program = argv.next().unwrap_or_default();

        ProcessCommandBuilder::new(&program)
            .args(argv)
            .current_dir(&job.work_dir)
            .maybe_timeout(job.timeout)
            .capture_to(job.work_dir.join(STDOUT_FILE), job.work_dir.join(STDERR_FILE))
            .build()
    }

    /// Execute the job in its working directory
    pub async fn run(&self, job: &Job) -> ExecutionResult {
        let command = self.process_command(job);
        trace!("Instance {} of {}: {}", job.ordinal, job.task_name, command.display());

        let started = Instant::now();
        let output = match self.runner.run(command).await {
            Ok(output) => output,
            Err(e) => {
                let error = SplitflowError::from(e);
                warn!(
                    "Instance {} of {} failed to run: {}",
                    job.ordinal, job.task_name, error
                );
                return ExecutionResult::errored(job.checksum.clone(), error.to_string());
            }
        };

        let stdout_path = job.work_dir.join(STDOUT_FILE);
        let stderr_path = job.work_dir.join(STDERR_FILE);
        let captured = match read_capture(&stdout_path).await {
            Ok(stdout) => read_capture(&stderr_path).await.map(|stderr| (stdout, stderr)),
            Err(e) => Err(e),
        };
        let (stdout, stderr) = match captured {
            Ok(text) => text,
            Err(e) => {
                return ExecutionResult::errored(
                    job.checksum.clone(),
                    format!("failed to read captured output in {}: {}", job.work_dir.display(), e),
                )
            }
        };

        let return_code = match output.status {
            ExitStatus::Success => 0,
            ExitStatus::Error(code) => code,
            ExitStatus::Timeout => {
                return ExecutionResult::errored(
                    job.checksum.clone(),
                    format!("timed out after {:?}", started.elapsed()),
                )
            }
            ExitStatus::Signal(signal) => {
                return ExecutionResult::errored(
                    job.checksum.clone(),
                    format!("terminated by signal {}", signal),
                )
            }
        };

        let result = ExecutionResult::completed(
            job.checksum.clone(),
            return_code,
            &stdout,
            &stderr,
            stdout_path,
            stderr_path,
            output.duration,
        );
        debug!(
            "Instance {} of {} exited with {} in {:?}",
            job.ordinal, job.task_name, return_code, output.duration
        );
        result
    }

    /// Job script for a batch scheduler.
    ///
    /// The script records the command's exit status in `returncode.txt`,
    /// renamed into place so a reader never sees a partial write.
    pub fn render_script(&self, job: &Job) -> String {
        let command = shell_words::join(self.argv(job));
        let work_dir = shell_words::quote(&job.work_dir.to_string_lossy()).into_owned();

        format!(
            "#!/bin/bash\n\
             # {task} instance {ordinal} ({checksum})\n\
             cd {work_dir} || exit 1\n\
             {command} > {stdout} 2> {stderr}\n\
             echo $? > {rc}.tmp && mv {rc}.tmp {rc}\n",
            task = job.task_name,
            ordinal = job.ordinal,
            checksum = job.checksum,
            work_dir = work_dir,
            command = command,
            stdout = STDOUT_FILE,
            stderr = STDERR_FILE,
            rc = RETURNCODE_FILE,
        )
    }

    /// Read back what a job script left in the working directory
    pub async fn collect(&self, job: &Job) -> ExecutionResult {
        let rc_path = job.work_dir.join(RETURNCODE_FILE);
        let return_code = match tokio::fs::read_to_string(&rc_path).await {
            Ok(content) => match content.trim().parse::<i32>() {
                Ok(code) => code,
                Err(_) => {
                    return ExecutionResult::errored(
                        job.checksum.clone(),
                        format!("unreadable return code in {}", rc_path.display()),
                    )
                }
            },
            Err(_) => {
                return ExecutionResult::errored(
                    job.checksum.clone(),
                    format!(
                        "job finished without recording a return code in {}",
                        job.work_dir.display()
                    ),
                )
            }
        };

        let stdout_path = job.work_dir.join(STDOUT_FILE);
        let stderr_path = job.work_dir.join(STDERR_FILE);
        let stdout = read_capture(&stdout_path).await.unwrap_or_default();
        let stderr = read_capture(&stderr_path).await.unwrap_or_default();

        ExecutionResult::completed(
            job.checksum.clone(),
            return_code,
            &stdout,
            &stderr,
            stdout_path,
            stderr_path,
            std::time::Duration::ZERO,
        )
    }
}

/// Captured bytes as text for the output bindings; the file itself is untouched
async fn read_capture(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Checksum;
    use crate::execution::ContainerRuntime;
    use crate::subprocess::{MockProcessRunner, TokioProcessRunner};
    use crate::task::{BindMode, ContainerSpec};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn job(command: &[&str], work_dir: PathBuf) -> Job {
        Job {
            checksum: Checksum::of_bytes(command.join(" ").as_bytes()),
            task_name: "test".to_string(),
            ordinal: 0,
            command: command.iter().map(|s| s.to_string()).collect(),
            container: None,
            work_dir,
            timeout: None,
        }
    }

    fn local_executor() -> Executor {
        Executor::new(Arc::new(TokioProcessRunner), ContainerConfig::default())
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let temp = TempDir::new().unwrap();
        let result = local_executor()
            .run(&job(&["echo", "one"], temp.path().to_path_buf()))
            .await;

        assert!(result.is_success());
        assert_eq!(result.stdout(), Some("one"));
        assert_eq!(
            std::fs::read_to_string(temp.path().join(STDOUT_FILE)).unwrap(),
            "one\n"
        );
    }

    #[tokio::test]
    async fn test_captured_files_keep_non_utf8_bytes() {
        let temp = TempDir::new().unwrap();
        let result = local_executor()
            .run(&job(&["sh", "-c", "printf '\\377\\376'"], temp.path().to_path_buf()))
            .await;

        assert!(result.is_success());
        let stdout_path = result.stdout_path.clone().unwrap();
        assert_eq!(std::fs::read(stdout_path).unwrap(), vec![0xff, 0xfe]);
        assert_eq!(result.stdout(), Some("\u{fffd}\u{fffd}"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_errored() {
        let temp = TempDir::new().unwrap();
        let result = local_executor()
            .run(&job(&["sh", "-c", "echo bad >&2; exit 3"], temp.path().to_path_buf()))
            .await;

        assert!(result.errored);
        assert_eq!(result.return_code, Some(3));
        assert_eq!(result.stderr(), Some("bad"));
        assert!(result.error.unwrap().contains("return code 3"));
    }

    #[tokio::test]
    async fn test_missing_program_is_errored_not_err() {
        let temp = TempDir::new().unwrap();
        let result = local_executor()
            .run(&job(&["no-such-binary-xyz"], temp.path().to_path_buf()))
            .await;

        assert!(result.errored);
        assert_eq!(result.return_code, None);
        assert!(result.error.unwrap().contains("E3001"));
    }

    #[tokio::test]
    async fn test_timeout_is_errored() {
        let temp = TempDir::new().unwrap();
        let mut job = job(&["sleep", "5"], temp.path().to_path_buf());
        job.timeout = Some(Duration::from_millis(100));

        let result = local_executor().run(&job).await;
        assert!(result.errored);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_container_job_is_wrapped() {
        let temp = TempDir::new().unwrap();
        let mock = MockProcessRunner::new();
        mock.expect_command("singularity").returns_stdout("/output_dir\n").finish();

        let executor = Executor::new(Arc::new(mock.clone()), ContainerConfig::default());
        let mut job = job(&["pwd"], temp.path().to_path_buf());
        job.container =
            Some(ContainerSpec::new("debian.sif").bind("/data", "/BASE", BindMode::Rw));

        let result = executor.run(&job).await;
        assert_eq!(result.stdout(), Some("/output_dir"));

        let calls = mock.get_call_history();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[0], "exec");
        assert!(calls[0].args.contains(&"/data:/BASE:rw".to_string()));
        assert_eq!(calls[0].args.last().unwrap(), "pwd");
        assert_eq!(calls[0].working_dir.as_deref(), Some(temp.path()));
    }

    #[tokio::test]
    async fn test_configured_runtime_binary() {
        let temp = TempDir::new().unwrap();
        let config = ContainerConfig {
            runtime: ContainerRuntime::Docker,
            binary: Some(PathBuf::from("/usr/local/bin/docker")),
        };
        let executor = Executor::new(Arc::new(MockProcessRunner::new()), config);
        let mut job = job(&["ls"], temp.path().to_path_buf());
        job.container = Some(ContainerSpec::new("debian"));

        let argv = executor.argv(&job);
        assert_eq!(argv[0], "/usr/local/bin/docker");
        assert_eq!(argv[1], "run");
    }

    #[tokio::test]
    async fn test_script_round_trip_through_sh() {
        let temp = TempDir::new().unwrap();
        let executor = local_executor();
        let job = job(&["sh", "-c", "echo 'two words'; exit 4"], temp.path().to_path_buf());

        let script_path = temp.path().join("job.sh");
        std::fs::write(&script_path, executor.render_script(&job)).unwrap();
        let status = std::process::Command::new("bash")
            .arg(&script_path)
            .status()
            .unwrap();
        assert!(status.success());

        let result = executor.collect(&job).await;
        assert_eq!(result.return_code, Some(4));
        assert_eq!(result.stdout(), Some("two words"));
        assert!(result.errored);
    }

    #[tokio::test]
    async fn test_collect_without_return_code() {
        let temp = TempDir::new().unwrap();
        let result = local_executor()
            .collect(&job(&["true"], temp.path().to_path_buf()))
            .await;
        assert!(result.errored);
        assert_eq!(result.return_code, None);
    }
}
