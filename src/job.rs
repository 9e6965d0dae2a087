//! The job data model (`spec.md` §3).
//!
//! Mirrors the shape of the teacher's `core::job::JobState` — a closed,
//! `strum`-derived enum with a `Display`/`FromStr` round trip so the status
//! can live as a single TEXT column on disk (`src/core/job.rs`,
//! `CHECK (state IN (...))` in `src/core/db.rs`) — but the variant set and
//! semantics follow `spec.md` §3 rather than the teacher's SLURM-flavoured
//! states.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Closed status enumeration. `spec.md` §3, §9 ("Status polymorphism").
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Blocked,
    Stopped,
}

impl JobStatus {
    /// Terminal statuses accept no further transitions except `clear_jobs`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Blocked | JobStatus::Stopped
        )
    }

    /// Statuses that count as "the dependency failed" for propagation.
    pub fn is_failure_like(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Blocked)
    }
}

/// A row in the job store. `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: Vec<String>,
    pub gpus: u32,
    pub priority: i64,
    pub memory_tag: Option<String>,
    pub cwd: Option<String>,
    pub status: JobStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub gpus_assigned: Vec<u32>,
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub pid: Option<i32>,
}

/// Parameters accepted by [`crate::store::Store::add_job`].
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub command: Vec<String>,
    pub gpus: u32,
    pub priority: i64,
    pub depends_on: Vec<String>,
    pub memory_tag: Option<String>,
    pub cwd: Option<String>,
}
