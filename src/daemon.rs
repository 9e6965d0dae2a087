//! Daemon process lifecycle (`spec.md` §4.3).
//!
//! Grounded in the teacher's `crates/slurmletd` (`src/main.rs`, `lib.rs`):
//! `daemonize::Daemonize::new().pid_file(..).stdout(..).stderr(..)` to fork
//! into the background with stdout/stderr redirected to files under the
//! state directory. `status`/`stop` are new here — the teacher never reads
//! its own PID file back, so the liveness probe (`kill(pid, 0)`) and
//! SIGTERM-then-wait shutdown follow `spec.md` §4.3 directly, using the same
//! `libc::kill` primitive the teacher's worker-signalling code relies on
//! elsewhere in the tree.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::store::pid_is_alive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(i32),
    NotRunning,
}

/// Fork into the background, redirecting stdout/stderr to `config.log_file()`
/// and writing `config.pid_file()`. Must be called before any tokio runtime
/// is started, since `daemonize` forks the process.
pub fn daemonize(config: &Config) -> Result<()> {
    fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating state directory {:?}", config.state_dir))?;

    if let DaemonStatus::Running(pid) = status(config)? {
        anyhow::bail!("raveld is already running (pid {pid})");
    }

    let log_file = File::create(config.log_file())
        .with_context(|| format!("creating log file {:?}", config.log_file()))?;
    let stderr_file = log_file
        .try_clone()
        .context("duplicating log file handle for stderr")?;

    let daemonize = daemonize::Daemonize::new()
        .pid_file(config.pid_file())
        .stdout(log_file)
        .stderr(stderr_file);

    daemonize.start().context("failed to daemonize")?;
    Ok(())
}

/// Read the pid file and probe liveness with `kill(pid, 0)`. A pid file that
/// refers to a dead process is treated as stale and removed.
pub fn status(config: &Config) -> Result<DaemonStatus> {
    let pid_path = config.pid_file();
    let pid = match read_pid_file(&pid_path)? {
        Some(pid) => pid,
        None => return Ok(DaemonStatus::NotRunning),
    };

    if pid_is_alive(pid) {
        Ok(DaemonStatus::Running(pid))
    } else {
        let _ = fs::remove_file(&pid_path);
        Ok(DaemonStatus::NotRunning)
    }
}

/// Send SIGTERM and wait up to 10s for the process to exit, polling every
/// 200ms. `spec.md` §4.3 ("Cooperative shutdown").
pub async fn stop(config: &Config) -> Result<bool> {
    let pid = match status(config)? {
        DaemonStatus::NotRunning => return Ok(false),
        DaemonStatus::Running(pid) => pid,
    };

    // SAFETY: signalling a pid we just confirmed is alive and own.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    let deadline = Duration::from_secs(10);
    let step = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if !pid_is_alive(pid) {
            let _ = fs::remove_file(config.pid_file());
            return Ok(true);
        }
        tokio::time::sleep(step).await;
        waited += step;
    }

    anyhow::bail!("daemon (pid {pid}) did not exit within {}s of SIGTERM", deadline.as_secs())
}

fn read_pid_file(path: &Path) -> Result<Option<i32>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading pid file {path:?}"))?;
    let pid = contents
        .trim()
        .parse::<i32>()
        .with_context(|| format!("pid file {path:?} did not contain a valid pid"))?;
    Ok(Some(pid))
}
