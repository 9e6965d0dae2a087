//! The job store (`spec.md` §4.1) — a durable, process-safe repository of
//! jobs and dependency edges shared by the daemon and any number of client
//! processes.
//!
//! Grounded in the teacher's orphaned `src/core/db.rs`: a `r2d2`-pooled
//! `rusqlite::Connection` with WAL journaling, the same
//! `PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; PRAGMA synchronous
//! = NORMAL; PRAGMA busy_timeout = 5000;` init block, and a
//! `CREATE TABLE IF NOT EXISTS` schema block run on every open. That module
//! was never wired into the teacher's `core::mod` (no `pub mod db;`) and
//! never appeared in any `Cargo.toml` dependency list — it is reused here as
//! the actual persistence layer, with `rusqlite`/`r2d2`/`r2d2_sqlite` now a
//! real dependency of this crate (see DESIGN.md).
//!
//! What's new relative to the teacher: the schema, claim transaction,
//! readiness predicate, and failure-propagation pass follow `spec.md` §3–4.1
//! rather than the teacher's SLURM-shaped `jobs` table (no `conda_env`,
//! `task_id`, `group_id`, archival tables, ...).

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;

use crate::job::{Job, JobStatus, NewJob};

const SCHEMA_BASE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    gpus INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'done', 'failed', 'blocked', 'stopped')),
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    returncode INTEGER,
    stdout TEXT NOT NULL DEFAULT '',
    stderr TEXT NOT NULL DEFAULT '',
    pid INTEGER
);

CREATE TABLE IF NOT EXISTS job_gpu_assignments (
    job_id TEXT NOT NULL,
    gpu_index INTEGER NOT NULL,
    PRIMARY KEY (job_id, gpu_index),
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS job_dependencies (
    job_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (job_id, depends_on)
);

CREATE TABLE IF NOT EXISTS scheduler_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_dependencies_job_id ON job_dependencies(job_id);
CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on ON job_dependencies(depends_on);
"#;

/// Columns added after the original schema. Added via `ALTER TABLE` with the
/// "column already exists" error swallowed, per `spec.md` §4.1 ("Schema
/// evolution") — this gives forward-compatible upgrades from a database
/// created by an older build without a separate migration tool.
const EVOLUTION_COLUMNS: &[(&str, &str)] = &[
    ("priority", "INTEGER NOT NULL DEFAULT 0"),
    ("memory_tag", "TEXT"),
    ("cwd", "TEXT"),
];

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Clone)]
pub struct Store {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Store {
    /// Open (creating if absent) the database at `db_path`, establishing a
    /// pooled connection manager and running schema creation/evolution.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {parent:?}"))?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute("PRAGMA foreign_keys = ON", [])?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;",
            )?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(10)
            .min_idle(Some(1))
            .build(manager)
            .context("failed to build sqlite connection pool")?;

        let store = Self {
            pool: Arc::new(pool),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// An in-memory store, useful for tests that don't want a temp file.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute("PRAGMA foreign_keys = ON", [])?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("failed to build in-memory sqlite pool")?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.pool.get().context("getting pooled connection")?;
        conn.execute_batch(SCHEMA_BASE_SQL)
            .context("creating base schema")?;

        for (column, ddl) in EVOLUTION_COLUMNS {
            let sql = format!("ALTER TABLE jobs ADD COLUMN {column} {ddl}");
            match conn.execute(&sql, []) {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(_, Some(msg)))
                    if msg.contains("duplicate column name") => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("adding column {column} to jobs"))
                }
            }
        }
        Ok(())
    }

    // ---- writes -----------------------------------------------------

    /// `spec.md` §4.1: generate a fresh id (retried on collision), insert a
    /// `queued` row with `created_at = now`, and insert dependency edges in
    /// the same transaction.
    pub fn add_job(&self, new: NewJob) -> Result<String> {
        let mut conn = self.pool.get().context("getting pooled connection")?;
        let command_json =
            serde_json::to_string(&new.command).context("serializing job command")?;
        let now = now_secs();

        for _ in 0..16 {
            let id = crate::id::generate();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("beginning add_job transaction")?;

            let inserted = tx.execute(
                "INSERT INTO jobs (id, command, gpus, priority, memory_tag, cwd, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7)",
                params![id, command_json, new.gpus, new.priority, new.memory_tag, new.cwd, now],
            );

            match inserted {
                Ok(_) => {
                    for dep in &new.depends_on {
                        tx.execute(
                            "INSERT OR IGNORE INTO job_dependencies (job_id, depends_on) VALUES (?1, ?2)",
                            params![id, dep],
                        )
                        .context("inserting dependency edge")?;
                    }
                    tx.commit().context("committing add_job transaction")?;
                    return Ok(id);
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    // id collision: retry with a freshly generated id.
                    continue;
                }
                Err(e) => return Err(e).context("inserting job row"),
            }
        }
        anyhow::bail!("failed to allocate a unique job id after repeated collisions")
    }

    /// `spec.md` §4.1: append dependency edges; duplicates are tolerated
    /// silently via `INSERT OR IGNORE`.
    pub fn add_dependencies(&self, id: &str, deps: &[String]) -> Result<()> {
        let conn = self.pool.get().context("getting pooled connection")?;
        for dep in deps {
            conn.execute(
                "INSERT OR IGNORE INTO job_dependencies (job_id, depends_on) VALUES (?1, ?2)",
                params![id, dep],
            )
            .context("inserting dependency edge")?;
        }
        Ok(())
    }

    /// The linearisation point for "this dispatcher won the claim".
    /// `spec.md` §4.1, §4.4, §8.
    pub fn try_claim_job(&self, id: &str, gpus_assigned: &[u32]) -> Result<bool> {
        let mut conn = self.pool.get().context("getting pooled connection")?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("beginning claim transaction")?;

        let updated = tx
            .execute(
                "UPDATE jobs SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'queued'",
                params![now_secs(), id],
            )
            .context("claiming job")?;

        if updated == 1 {
            for gpu in gpus_assigned {
                tx.execute(
                    "INSERT INTO job_gpu_assignments (job_id, gpu_index) VALUES (?1, ?2)",
                    params![id, gpu],
                )
                .context("recording gpu assignment")?;
            }
            tx.commit().context("committing claim transaction")?;
            Ok(true)
        } else {
            // Someone else won, or the job wasn't queued. Nothing to commit.
            tx.rollback().ok();
            Ok(false)
        }
    }

    /// Record the child's OS pid once the worker has spawned it, so
    /// `stop_job` has a definite target. `spec.md` §9 ("Cooperative
    /// cancellation").
    pub fn set_job_pid(&self, id: &str, pid: i32) -> Result<()> {
        let conn = self.pool.get().context("getting pooled connection")?;
        conn.execute(
            "UPDATE jobs SET pid = ?1 WHERE id = ?2 AND status = 'running'",
            params![pid, id],
        )
        .context("recording job pid")?;
        Ok(())
    }

    /// `spec.md` §4.1, §4.5: terminal fields and `finished_at`. A no-op if
    /// the job is not currently `running`.
    pub fn set_job_finished(
        &self,
        id: &str,
        status: JobStatus,
        returncode: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) -> Result<()> {
        anyhow::ensure!(
            status == JobStatus::Done || status == JobStatus::Failed,
            "set_job_finished only accepts Done or Failed, got {status}"
        );
        let conn = self.pool.get().context("getting pooled connection")?;
        conn.execute(
            "UPDATE jobs SET status = ?1, returncode = ?2, stdout = ?3, stderr = ?4, finished_at = ?5
             WHERE id = ?6 AND status = 'running'",
            params![status.to_string(), returncode, stdout, stderr, now_secs(), id],
        )
        .context("finishing job")?;
        Ok(())
    }

    /// `stop_job` administrative transition: records a terminal `stopped`
    /// row. Only affects a job that is currently `running`.
    pub fn set_job_stopped(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get().context("getting pooled connection")?;
        let updated = conn
            .execute(
                "UPDATE jobs SET status = 'stopped', finished_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![now_secs(), id],
            )
            .context("stopping job")?;
        Ok(updated == 1)
    }

    /// `spec.md` §4.1, §8: atomically blocks every `queued` job with at
    /// least one predecessor in `{failed, blocked}`. Idempotent.
    pub fn mark_blocked_jobs_due_to_failed_deps(&self) -> Result<usize> {
        let conn = self.pool.get().context("getting pooled connection")?;
        let affected = conn
            .execute(
                "UPDATE jobs SET status = 'blocked'
                 WHERE status = 'queued'
                 AND EXISTS (
                     SELECT 1 FROM job_dependencies d
                     JOIN jobs p ON p.id = d.depends_on
                     WHERE d.job_id = jobs.id AND p.status IN ('failed', 'blocked')
                 )",
                [],
            )
            .context("marking blocked jobs")?;
        Ok(affected)
    }

    /// Startup sweep (`spec.md` §9 Open Questions): any `running` job whose
    /// recorded pid is no longer alive is failed with a diagnostic message.
    /// Jobs with no recorded pid (crashed before the worker got that far)
    /// are treated the same way.
    pub fn reap_orphaned_running_jobs(&self) -> Result<usize> {
        let running = self.list_jobs(Some(&[JobStatus::Running]))?;
        let mut reaped = 0;
        for job in running {
            let alive = job.pid.is_some_and(pid_is_alive);
            if !alive {
                self.set_job_finished(
                    &job.id,
                    JobStatus::Failed,
                    None,
                    &job.stdout,
                    "orphaned: daemon restarted while job was running",
                )?;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    // ---- reads --------------------------------------------------------

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.pool.get().context("getting pooled connection")?;
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()
            .context("fetching job")?;
        let job = job.transpose().context("decoding job row")?;
        match job {
            Some(mut job) => {
                job.gpus_assigned = self.gpu_assignments(&conn, id)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// `spec.md` §4.1: ordered by `created_at` ascending; optional status
    /// filter.
    pub fn list_jobs(&self, statuses: Option<&[JobStatus]>) -> Result<Vec<Job>> {
        let conn = self.pool.get().context("getting pooled connection")?;
        let jobs = match statuses {
            None => {
                let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC, rowid ASC")?;
                stmt.query_map([], row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            Some(statuses) => {
                let placeholders = sql_placeholders(statuses.len());
                let sql = format!(
                    "SELECT * FROM jobs WHERE status IN ({placeholders}) ORDER BY created_at ASC, rowid ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let params = status_params(statuses);
                stmt.query_map(rusqlite::params_from_iter(params), row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        self.hydrate_gpu_assignments(&conn, jobs)
    }

    /// `spec.md` §4.1, §4.4, §8: the readiness predicate — `queued` jobs
    /// whose entire dependency set is satisfied by `done` predecessors,
    /// ordered `(priority DESC, created_at ASC, rowid ASC)`. An unknown
    /// dependency target is treated as unsatisfied (`LEFT JOIN` yields
    /// `NULL`), matching `spec.md` §3's "never-satisfied" rule.
    pub fn list_ready_jobs(&self, limit: Option<usize>) -> Result<Vec<Job>> {
        let conn = self.pool.get().context("getting pooled connection")?;
        let sql = "SELECT j.* FROM jobs j
             WHERE j.status = 'queued'
             AND NOT EXISTS (
                 SELECT 1 FROM job_dependencies d
                 LEFT JOIN jobs p ON p.id = d.depends_on
                 WHERE d.job_id = j.id AND (p.id IS NULL OR p.status != 'done')
             )
             ORDER BY j.priority DESC, j.created_at ASC, j.rowid ASC
             LIMIT ?1";
        let limit = limit.unwrap_or(i64::MAX as usize) as i64;
        let mut stmt = conn.prepare(sql)?;
        let jobs = stmt
            .query_map(params![limit], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        self.hydrate_gpu_assignments(&conn, jobs)
    }

    /// `spec.md` §4.1: ordered by `created_at` descending.
    pub fn list_recent_jobs(
        &self,
        limit: usize,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Vec<Job>> {
        let conn = self.pool.get().context("getting pooled connection")?;
        let jobs = match statuses {
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1")?;
                stmt.query_map(params![limit as i64], row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            Some(statuses) => {
                let placeholders = sql_placeholders(statuses.len());
                let sql = format!(
                    "SELECT * FROM jobs WHERE status IN ({placeholders})
                     ORDER BY created_at DESC, rowid DESC LIMIT ?{}",
                    statuses.len() + 1
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut all_params = status_params(statuses);
                all_params.push(Box::new(limit as i64));
                stmt.query_map(rusqlite::params_from_iter(all_params), row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        self.hydrate_gpu_assignments(&conn, jobs)
    }

    /// `spec.md` §4.1: bulk delete; without a filter, clears all jobs and
    /// edges. `job_gpu_assignments` cascades via `ON DELETE CASCADE`, but
    /// `job_dependencies` carries no foreign key (an edge may legitimately
    /// name a `depends_on` target that was never inserted, per the
    /// "never-satisfied" rule in `spec.md` §3), so edges touching a cleared
    /// job are deleted explicitly here, on either side of the edge.
    pub fn clear_jobs(&self, statuses: Option<&[JobStatus]>) -> Result<usize> {
        let mut conn = self.pool.get().context("getting pooled connection")?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("beginning clear_jobs transaction")?;

        let affected = match statuses {
            None => {
                tx.execute("DELETE FROM job_dependencies", [])?;
                tx.execute("DELETE FROM jobs", [])?
            }
            Some(statuses) => {
                let placeholders = sql_placeholders(statuses.len());
                let selected_ids = format!("SELECT id FROM jobs WHERE status IN ({placeholders})");

                let dep_sql = format!(
                    "DELETE FROM job_dependencies
                     WHERE job_id IN ({selected_ids}) OR depends_on IN ({selected_ids})"
                );
                // The id subquery appears twice in `dep_sql`, so its status
                // params must be bound twice too.
                let mut dep_params = status_params(statuses);
                dep_params.extend(status_params(statuses));
                tx.execute(&dep_sql, rusqlite::params_from_iter(dep_params))?;

                let jobs_sql = format!("DELETE FROM jobs WHERE status IN ({placeholders})");
                tx.execute(&jobs_sql, rusqlite::params_from_iter(status_params(statuses)))?
            }
        };

        tx.commit().context("committing clear_jobs transaction")?;
        Ok(affected)
    }

    fn gpu_assignments(&self, conn: &rusqlite::Connection, id: &str) -> Result<Vec<u32>> {
        let mut stmt = conn.prepare(
            "SELECT gpu_index FROM job_gpu_assignments WHERE job_id = ?1 ORDER BY gpu_index",
        )?;
        let ids = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<u32>>>()
            .context("reading gpu assignments")?;
        Ok(ids)
    }

    fn hydrate_gpu_assignments(
        &self,
        conn: &rusqlite::Connection,
        mut jobs: Vec<Job>,
    ) -> Result<Vec<Job>> {
        for job in &mut jobs {
            job.gpus_assigned = self.gpu_assignments(conn, &job.id)?;
        }
        Ok(jobs)
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let command_json: String = row.get("command")?;
    let command: Vec<String> = serde_json::from_str(&command_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status_str: String = row.get("status")?;
    let status: JobStatus = status_str.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(
            0,
            "status".to_string(),
            rusqlite::types::Type::Text,
        )
    })?;

    Ok(Job {
        id: row.get("id")?,
        command,
        gpus: row.get::<_, i64>("gpus")? as u32,
        priority: row.get("priority")?,
        memory_tag: row.get("memory_tag")?,
        cwd: row.get("cwd")?,
        status,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        gpus_assigned: Vec::new(),
        returncode: row.get("returncode")?,
        stdout: row.get("stdout")?,
        stderr: row.get("stderr")?,
        pid: row.get("pid")?,
    })
}

fn sql_placeholders(n: usize) -> String {
    std::iter::repeat("?")
        .take(n)
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_params(statuses: &[JobStatus]) -> Vec<Box<dyn rusqlite::ToSql>> {
    statuses
        .iter()
        .map(|s| Box::new(s.to_string()) as Box<dyn rusqlite::ToSql>)
        .collect()
}

/// Signal-0 liveness probe, shared with the daemon lifecycle's PID-file
/// check (`spec.md` §4.3).
pub fn pid_is_alive(pid: i32) -> bool {
    // SAFETY: `kill` with signal 0 performs no action beyond error checking.
    unsafe { libc::kill(pid, 0) == 0 }
}
