//! The dispatcher tick loop (`spec.md` §4.4).
//!
//! Grounded in the teacher's `src/bin/gflowd/scheduler_runtime.rs`
//! (`SchedulerRuntime`): a `tokio::sync::Notify`-woken loop that holds a
//! `Arc<RwLock<..>>` view of available resources, reserves GPU indices for
//! the duration of a tick so two jobs claimed back-to-back never get handed
//! the same device before the probe catches up, and spawns accepted jobs
//! onto a bounded worker pool. The memory-tag ceiling and DAG-aware ready
//! query are new, following `spec.md` §4.4 directly — the teacher's
//! scheduler has no notion of either.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info};

use crate::config::Config;
use crate::job::{Job, JobStatus};
use crate::probe::ResourceProbe;
use crate::store::Store;

/// How long the dispatcher sleeps between ticks when nothing woke it early.
/// `spec.md` §4.4.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Drives the scheduling loop until `shutdown` is notified. Intended to run
/// as a single background task alongside a bounded pool of worker tasks.
pub struct Dispatcher {
    store: Store,
    config: Config,
    probe: ResourceProbe,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(store: Store, config: Config) -> Self {
        let probe = ResourceProbe::new(config.no_gpu, config.test_mode);
        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        Self {
            store,
            config,
            probe,
            semaphore,
        }
    }

    /// Run until `shutdown` fires, ticking immediately, then waiting for
    /// either `wake` (a client just submitted a job) or `POLL_INTERVAL`.
    pub async fn run(&self, wake: Arc<Notify>, shutdown: Arc<Notify>) -> Result<()> {
        self.store
            .reap_orphaned_running_jobs()
            .map(|n| {
                if n > 0 {
                    info!(reaped = n, "reaped orphaned running jobs at startup");
                }
            })?;

        loop {
            self.tick().await?;

            tokio::select! {
                _ = shutdown.notified() => return Ok(()),
                _ = wake.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// One scheduling pass: propagate failures, then greedily claim and
    /// dispatch as many ready jobs as current slots/GPUs/tag ceilings allow.
    /// Returns whether any job was claimed.
    pub async fn tick(&self) -> Result<bool> {
        self.store.mark_blocked_jobs_due_to_failed_deps()?;

        let running = self.store.list_jobs(Some(&[JobStatus::Running]))?;
        let available_permits = self.semaphore.available_permits();
        if available_permits == 0 {
            return Ok(false);
        }

        let tag_ceilings = &self.config.memory_limits;
        let mut tag_tally: HashMap<String, u32> = HashMap::new();
        for job in &running {
            if let Some(tag) = &job.memory_tag {
                *tag_tally.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        let mut reserved: HashSet<u32> = HashSet::new();
        for job in &running {
            reserved.extend(job.gpus_assigned.iter().copied());
        }

        let candidates = self
            .store
            .list_ready_jobs(Some(available_permits * 2))?;

        let mut dispatched = false;

        for job in candidates {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            if let Some(tag) = &job.memory_tag {
                if let Some(&ceiling) = tag_ceilings.get(tag) {
                    let current = *tag_tally.get(tag).unwrap_or(&0);
                    if current >= ceiling {
                        debug!(job_id = %job.id, tag, ceiling, "skipping job: memory tag at ceiling");
                        continue;
                    }
                }
            }

            let gpu_indices = if job.gpus == 0 {
                Vec::new()
            } else {
                let free = self.probe.free_indices(&reserved).await;
                if (free.len() as u32) < job.gpus {
                    debug!(job_id = %job.id, needed = job.gpus, free = free.len(), "skipping job: insufficient free gpus");
                    continue;
                }
                free.into_iter().take(job.gpus as usize).collect::<Vec<_>>()
            };

            if !self.store.try_claim_job(&job.id, &gpu_indices)? {
                // Lost the race (shouldn't happen with a single dispatcher,
                // but the store makes no such assumption) or the job moved
                // on (e.g. was cleared concurrently). Move on.
                continue;
            }

            reserved.extend(gpu_indices.iter().copied());
            if let Some(tag) = &job.memory_tag {
                *tag_tally.entry(tag.clone()).or_insert(0) += 1;
            }
            dispatched = true;

            // Re-read the row so the worker sees `gpus_assigned` (and
            // `started_at`) as written by the claim, not the pre-claim
            // `queued` snapshot. `spec.md` §4.5 step 1.
            match self.store.get_job(&job.id)? {
                Some(claimed) => self.spawn_worker(claimed, permit),
                None => tracing::error!(job_id = %job.id, "claimed job vanished before re-read"),
            }
        }

        Ok(dispatched)
    }

    fn spawn_worker(&self, job: Job, permit: tokio::sync::OwnedSemaphorePermit) {
        let store = self.store.clone();
        let config = self.config.clone();
        let job_id = job.id.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = crate::worker::run(&store, &config, job).await {
                tracing::error!(job_id = %job_id, error = %e, "worker task failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;

    fn test_config() -> Config {
        Config {
            state_dir: std::env::temp_dir(),
            db_path: std::env::temp_dir().join("ravel-dispatcher-test.db"),
            max_workers: 2,
            memory_limits: HashMap::new(),
            no_gpu: true,
            test_mode: true,
            gpu_env_var: "CUDA_VISIBLE_DEVICES".to_string(),
        }
    }

    #[tokio::test]
    async fn tick_claims_ready_jobs_up_to_available_slots() {
        let store = Store::open_in_memory().unwrap();
        for _ in 0..3 {
            store
                .add_job(NewJob {
                    command: vec!["true".to_string()],
                    gpus: 0,
                    priority: 0,
                    depends_on: Vec::new(),
                    memory_tag: None,
                    cwd: None,
                })
                .unwrap();
        }

        let dispatcher = Dispatcher::new(store.clone(), test_config());
        let dispatched = dispatcher.tick().await.unwrap();
        assert!(dispatched);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let running_or_done = store
            .list_jobs(None)
            .unwrap()
            .into_iter()
            .filter(|j| j.status != JobStatus::Queued)
            .count();
        assert_eq!(running_or_done, 2, "only max_workers jobs should have been claimed");
    }

    #[tokio::test]
    async fn claimed_gpu_indices_reach_the_worker_as_an_env_var() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .add_job(NewJob {
                command: vec!["env".to_string()],
                gpus: 1,
                priority: 0,
                depends_on: Vec::new(),
                memory_tag: None,
                cwd: None,
            })
            .unwrap();

        let dispatcher = Dispatcher::new(store.clone(), test_config());
        let dispatched = dispatcher.tick().await.unwrap();
        assert!(dispatched);

        let job = wait_until_terminal(&store, &id).await;
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.gpus_assigned.len(), 1);
        assert!(
            job.stdout.contains("CUDA_VISIBLE_DEVICES="),
            "worker should have injected the visible-gpu env var into the child; got: {}",
            job.stdout
        );
    }

    async fn wait_until_terminal(store: &Store, id: &str) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = store.get_job(id).unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            assert!(tokio::time::Instant::now() < deadline, "job {id} never reached a terminal state");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn tick_respects_memory_tag_ceiling() {
        let store = Store::open_in_memory().unwrap();
        for _ in 0..2 {
            store
                .add_job(NewJob {
                    command: vec!["sleep".to_string(), "1".to_string()],
                    gpus: 0,
                    priority: 0,
                    depends_on: Vec::new(),
                    memory_tag: Some("large".to_string()),
                    cwd: None,
                })
                .unwrap();
        }

        let mut config = test_config();
        config.max_workers = 4;
        config.memory_limits.insert("large".to_string(), 1);

        let dispatcher = Dispatcher::new(store.clone(), config);
        dispatcher.tick().await.unwrap();

        let running = store
            .list_jobs(Some(&[JobStatus::Running]))
            .unwrap();
        assert_eq!(running.len(), 1, "memory tag ceiling should cap concurrent jobs");
    }
}
