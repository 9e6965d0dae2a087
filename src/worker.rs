//! Job execution (`spec.md` §4.5).
//!
//! The teacher's `TmuxExecutor` (`src/bin/gflowd/executor.rs`) wraps a job's
//! shell command in a tmux session so a human can attach to a running job;
//! that means going through `/bin/sh -c`, which this spec explicitly avoids
//! (`spec.md` §4.5: "the command is executed directly, never through a
//! shell"). What's kept from the teacher is the `Executor` trait shape
//! (`gflow-core/src/executor.rs`) generalized to a free function over
//! `tokio::process::Command`, and the in-memory stdout/stderr capture
//! pattern the teacher's runtime uses for short-lived jobs.

use anyhow::{Context, Result};
use std::process::Stdio;
use tracing::{info, warn};

use crate::config::Config;
use crate::job::{Job, JobStatus};
use crate::store::Store;

/// Run a claimed job to completion and persist its terminal state.
///
/// `job.gpus_assigned` (already recorded by `Store::try_claim_job`) is
/// exposed to the child as `config.gpu_env_var`, a comma-joined list of
/// indices — empty when the job requested zero GPUs or GPU scheduling is
/// disabled. `spec.md` §4.2, §4.5.
pub async fn run(store: &Store, config: &Config, job: Job) -> Result<()> {
    let Some((program, args)) = job.command.split_first() else {
        store
            .set_job_finished(&job.id, JobStatus::Failed, None, "", "empty command")
            .context("recording empty-command failure")?;
        return Ok(());
    };

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(cwd) = &job.cwd {
        command.current_dir(cwd);
    }

    if !job.gpus_assigned.is_empty() {
        let indices = job
            .gpus_assigned
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        command.env(&config.gpu_env_var, indices);
    }

    info!(job_id = %job.id, command = ?job.command, "starting job");

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "failed to spawn job");
            store
                .set_job_finished(
                    &job.id,
                    JobStatus::Failed,
                    None,
                    "",
                    &format!("failed to spawn: {e}"),
                )
                .context("recording spawn failure")?;
            return Ok(());
        }
    };

    if let Some(pid) = child.id() {
        store
            .set_job_pid(&job.id, pid as i32)
            .context("recording job pid")?;
    }

    let output = child
        .wait_with_output()
        .await
        .context("waiting for job process")?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let returncode = output.status.code();
    let status = if output.status.success() {
        JobStatus::Done
    } else {
        JobStatus::Failed
    };

    info!(job_id = %job.id, %status, returncode = ?returncode, "job finished");

    store
        .set_job_finished(&job.id, status, returncode, &stdout, &stderr)
        .context("recording job completion")?;

    Ok(())
}
