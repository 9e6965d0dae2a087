//! Client-side API (`spec.md` §4.6).
//!
//! The teacher's `Client` (old `src/client.rs`, not carried forward) talks to
//! a `gflowd` HTTP server via `reqwest`/`axum`. This spec's multiple
//! processes — the CLI, the daemon, a dashboard, a future web UI — all share
//! one SQLite file and rely on its own locking to serialize writers
//! (`spec.md` §4.1, §5), so there is no server to dial: a "client" here is
//! just a thin, synchronous wrapper around [`crate::store::Store`] that any
//! process can construct by opening the same database file.
//!
//! `stop_job` is new: it implements the cooperative-cancellation contract of
//! `spec.md` §9 using the same `libc::kill` primitive the daemon lifecycle
//! uses for its own liveness probe (`src/daemon.rs`).

use anyhow::{Context, Result};
use std::time::Duration;

use crate::job::{Job, JobStatus, NewJob};
use crate::store::{pid_is_alive, Store};

/// How long to wait after SIGTERM before escalating to SIGKILL.
/// `spec.md` §9 ("Cooperative cancellation").
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Client {
    store: Store,
}

impl Client {
    pub fn open(config: &crate::config::Config) -> Result<Self> {
        let store = Store::open(&config.db_path)?;
        Ok(Self { store })
    }

    pub fn from_store(store: Store) -> Self {
        Self { store }
    }

    pub fn add_job(&self, new: NewJob) -> Result<String> {
        self.store.add_job(new)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.store.get_job(id)
    }

    pub fn list_jobs(&self, statuses: Option<&[JobStatus]>) -> Result<Vec<Job>> {
        self.store.list_jobs(statuses)
    }

    pub fn list_ready_jobs(&self) -> Result<Vec<Job>> {
        self.store.list_ready_jobs(None)
    }

    pub fn list_recent_jobs(&self, limit: usize, statuses: Option<&[JobStatus]>) -> Result<Vec<Job>> {
        self.store.list_recent_jobs(limit, statuses)
    }

    pub fn clear_jobs(&self, statuses: Option<&[JobStatus]>) -> Result<usize> {
        self.store.clear_jobs(statuses)
    }

    /// Cooperatively cancel a running job: SIGTERM, wait up to
    /// [`STOP_GRACE_PERIOD`], then SIGKILL. Records a terminal `stopped` row
    /// once the process is confirmed dead. Returns `false` if the job is not
    /// currently running.
    pub async fn stop_job(&self, id: &str) -> Result<bool> {
        let job = self
            .store
            .get_job(id)?
            .with_context(|| format!("no such job: {id}"))?;

        if job.status != JobStatus::Running {
            return Ok(false);
        }

        let Some(pid) = job.pid else {
            // Claimed but not yet spawned (or the worker crashed before
            // recording a pid). Nothing to signal; mark it stopped directly.
            return self.store.set_job_stopped(id);
        };

        // SAFETY: signalling a pid recorded by our own worker for this job.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }

        let mut waited = Duration::ZERO;
        while waited < STOP_GRACE_PERIOD {
            if !pid_is_alive(pid) {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
            waited += STOP_POLL_INTERVAL;
        }

        if pid_is_alive(pid) {
            // SAFETY: same pid as above, still confirmed alive.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }

        self.store.set_job_stopped(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::from_store(Store::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn stop_job_on_non_running_job_is_a_no_op() {
        let client = client();
        let id = client
            .add_job(NewJob {
                command: vec!["true".to_string()],
                gpus: 0,
                priority: 0,
                depends_on: Vec::new(),
                memory_tag: None,
                cwd: None,
            })
            .unwrap();
        assert!(!client.stop_job(&id).await.unwrap());
    }

    #[tokio::test]
    async fn stop_job_without_recorded_pid_marks_stopped_directly() {
        let client = client();
        let id = client
            .add_job(NewJob {
                command: vec!["sleep".to_string(), "5".to_string()],
                gpus: 0,
                priority: 0,
                depends_on: Vec::new(),
                memory_tag: None,
                cwd: None,
            })
            .unwrap();
        client.store.try_claim_job(&id, &[]).unwrap();

        assert!(client.stop_job(&id).await.unwrap());
        assert_eq!(client.get_job(&id).unwrap().unwrap().status, JobStatus::Stopped);
    }
}
