//! Slurm client driven through its command-line tools.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

use super::batch::{BatchRequest, BatchScheduler, JobState};
use super::BackendKind;
use crate::config::BatchConfig;
use crate::error::{ErrorCode, Result, SplitflowError};
use crate::subprocess::{ProcessCommandBuilder, ProcessOutput, ProcessRunner};

pub struct SlurmScheduler {
    runner: Arc<dyn ProcessRunner>,
    config: BatchConfig,
}

impl SlurmScheduler {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: BatchConfig) -> Self {
        Self { runner, config }
    }

    /// `sbatch` arguments for one request, directives first
    pub fn submit_args(&self, request: &BatchRequest) -> Result<Vec<String>> {
        let directives = shell_words::split(&request.directives).map_err(|e| {
            SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("unparseable submit arguments '{}'", request.directives),
                Some("batch.submit_args".to_string()),
            )
            .with_source(e)
        })?;

        let mut args = vec!["--parsable".to_string()];
        args.extend(directives);
        args.push(format!("--job-name={}", request.job_name));
        args.push(format!("--output={}", request.scheduler_log.display()));
        args.push(format!("--chdir={}", request.work_dir.display()));
        args.push(request.script_path.to_string_lossy().into_owned());
        Ok(args)
    }

    async fn invoke(&self, program: &str, args: Vec<String>) -> Result<ProcessOutput> {
        let command = ProcessCommandBuilder::new(program).args(args).build();
        trace!("Slurm: {}", command.display());
        self.runner.run(command).await.map_err(|e| {
            SplitflowError::submission_with_code(
                ErrorCode::SUBMIT_GENERIC,
                format!("could not run {}", program),
                Some(BackendKind::BatchScheduler.to_string()),
            )
            .with_source(e)
        })
    }

    async fn sacct_state(&self, job_id: &str) -> Result<JobState> {
        let args = ["-n", "-X", "-P", "-o", "State", "-j", job_id]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.invoke(&self.config.sacct, args).await?;
        if !output.status.success() {
            return Ok(JobState::Unknown);
        }
        Ok(output
            .stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(parse_state)
            .unwrap_or(JobState::Unknown))
    }
}

/// Map a Slurm state name onto a job state. `CANCELLED by 123` and
/// similar suffixed forms are accepted.
pub fn parse_state(raw: &str) -> JobState {
    let state = raw
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches('+')
        .to_uppercase();

    match state.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => JobState::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "CANCELLED" | "PREEMPTED" | "REVOKED" => JobState::Cancelled,
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE" => {
            JobState::Failed
        }
        _ => JobState::Unknown,
    }
}

/// `--parsable` output is `jobid` or `jobid;cluster`
fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return None;
    }
    Some(id.to_string())
}

#[async_trait]
impl BatchScheduler for SlurmScheduler {
    async fn submit(&self, request: &BatchRequest) -> Result<String> {
        let output = self.invoke(&self.config.sbatch, self.submit_args(request)?).await?;

        if !output.status.success() {
            return Err(SplitflowError::submission_with_code(
                ErrorCode::SUBMIT_REJECTED,
                format!(
                    "sbatch rejected {}: {}",
                    request.job_name,
                    output.stderr.trim()
                ),
                Some(BackendKind::BatchScheduler.to_string()),
            ));
        }

        let job_id = parse_job_id(&output.stdout).ok_or_else(|| {
            SplitflowError::submission_with_code(
                ErrorCode::SUBMIT_REJECTED,
                format!("unexpected sbatch output: '{}'", output.stdout.trim()),
                Some(BackendKind::BatchScheduler.to_string()),
            )
        })?;
        debug!("sbatch accepted {} as {}", request.job_name, job_id);
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<JobState> {
        let args = ["-h", "-o", "%T", "-j", job_id]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.invoke(&self.config.squeue, args).await?;

        // Finished jobs drop out of squeue; accounting still knows them
        let queued = output
            .status
            .success()
            .then(|| output.stdout.lines().find(|l| !l.trim().is_empty()).map(parse_state))
            .flatten();
        match queued {
            Some(state) => Ok(state),
            None => self.sacct_state(job_id).await,
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        let output = self
            .invoke(&self.config.scancel, vec![job_id.to_string()])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SplitflowError::submission(format!(
                "scancel {} failed: {}",
                job_id,
                output.stderr.trim()
            )))
        }
    }
}
