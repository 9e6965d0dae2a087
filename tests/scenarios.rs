//! End-to-end scheduling scenarios, exercising the store, dispatcher, and
//! worker together the way `raveld` wires them in production.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use ravel::config::Config;
use ravel::dispatcher::Dispatcher;
use ravel::job::{JobStatus, NewJob};
use ravel::store::Store;

fn config(dir: &std::path::Path, max_workers: usize) -> Config {
    Config {
        state_dir: dir.to_path_buf(),
        db_path: dir.join("ravel.db"),
        max_workers,
        memory_limits: HashMap::new(),
        no_gpu: true,
        test_mode: true,
        gpu_env_var: "CUDA_VISIBLE_DEVICES".to_string(),
    }
}

async fn wait_until_terminal(store: &Store, id: &str, timeout: Duration) -> ravel::job::Job {
    let deadline = tokio::time::Instant::now() + timeout;
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
async fn a_single_job_is_claimed_executed_and_recorded_done() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("ravel.db")).unwrap();
    let id = store
        .add_job(NewJob {
            command: vec!["echo".to_string(), "scenario-one".to_string()],
            gpus: 0,
            priority: 0,
            depends_on: Vec::new(),
            memory_tag: None,
            cwd: None,
        })
        .unwrap();

    let dispatcher = Dispatcher::new(store.clone(), config(dir.path(), 2));
    dispatcher.tick().await.unwrap();

    let job = wait_until_terminal(&store, &id, Duration::from_secs(5)).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.stdout.trim(), "scenario-one");
}

#[tokio::test]
async fn higher_priority_runs_before_an_older_lower_priority_job_under_one_slot() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("ravel.db")).unwrap();

    let low = store
        .add_job(NewJob {
            command: vec!["sleep".to_string(), "0.2".to_string()],
            gpus: 0,
            priority: 0,
            depends_on: Vec::new(),
            memory_tag: None,
            cwd: None,
        })
        .unwrap();
    let high = store
        .add_job(NewJob {
            command: vec!["sleep".to_string(), "0.2".to_string()],
            gpus: 0,
            priority: 10,
            depends_on: Vec::new(),
            memory_tag: None,
            cwd: None,
        })
        .unwrap();

    let dispatcher = Dispatcher::new(store.clone(), config(dir.path(), 1));
    dispatcher.tick().await.unwrap();

    // Only one slot: the high-priority job should have been claimed even
    // though it was submitted second.
    let high_job = store.get_job(&high).unwrap().unwrap();
    let low_job = store.get_job(&low).unwrap().unwrap();
    assert_eq!(high_job.status, JobStatus::Running);
    assert_eq!(low_job.status, JobStatus::Queued);
}

#[tokio::test]
async fn a_dependent_job_waits_for_its_predecessor_then_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("ravel.db")).unwrap();

    let first = store
        .add_job(NewJob {
            command: vec!["true".to_string()],
            gpus: 0,
            priority: 0,
            depends_on: Vec::new(),
            memory_tag: None,
            cwd: None,
        })
        .unwrap();
    let second = store
        .add_job(NewJob {
            command: vec!["echo".to_string(), "after-first".to_string()],
            gpus: 0,
            priority: 0,
            depends_on: vec![first.clone()],
            memory_tag: None,
            cwd: None,
        })
        .unwrap();

    let dispatcher = Dispatcher::new(store.clone(), config(dir.path(), 2));

    // First tick: only `first` is ready.
    dispatcher.tick().await.unwrap();
    wait_until_terminal(&store, &first, Duration::from_secs(5)).await;
    assert_eq!(store.get_job(&second).unwrap().unwrap().status, JobStatus::Queued);

    // Second tick: `first` is done, `second` becomes ready.
    dispatcher.tick().await.unwrap();
    let second_job = wait_until_terminal(&store, &second, Duration::from_secs(5)).await;
    assert_eq!(second_job.status, JobStatus::Done);
    assert_eq!(second_job.stdout.trim(), "after-first");
}

#[tokio::test]
async fn memory_tag_ceiling_limits_concurrent_jobs_sharing_a_tag() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("ravel.db")).unwrap();

    for _ in 0..3 {
        store
            .add_job(NewJob {
                command: vec!["sleep".to_string(), "0.3".to_string()],
                gpus: 0,
                priority: 0,
                depends_on: Vec::new(),
                memory_tag: Some("large".to_string()),
                cwd: None,
            })
            .unwrap();
    }

    let mut cfg = config(dir.path(), 10);
    cfg.memory_limits.insert("large".to_string(), 1);
    let dispatcher = Dispatcher::new(store.clone(), cfg);
    dispatcher.tick().await.unwrap();

    let running = store.list_jobs(Some(&[JobStatus::Running])).unwrap();
    assert_eq!(running.len(), 1, "ceiling of 1 should admit exactly one job of the tag");
}

#[tokio::test]
async fn a_failed_predecessor_blocks_its_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("ravel.db")).unwrap();

    let failing = store
        .add_job(NewJob {
            command: vec!["false".to_string()],
            gpus: 0,
            priority: 0,
            depends_on: Vec::new(),
            memory_tag: None,
            cwd: None,
        })
        .unwrap();
    let dependent = store
        .add_job(NewJob {
            command: vec!["true".to_string()],
            gpus: 0,
            priority: 0,
            depends_on: vec![failing.clone()],
            memory_tag: None,
            cwd: None,
        })
        .unwrap();

    let dispatcher = Dispatcher::new(store.clone(), config(dir.path(), 2));
    dispatcher.tick().await.unwrap();
    wait_until_terminal(&store, &failing, Duration::from_secs(5)).await;

    dispatcher.tick().await.unwrap();
    let dependent_job = store.get_job(&dependent).unwrap().unwrap();
    assert_eq!(dependent_job.status, JobStatus::Blocked);
}

#[tokio::test]
async fn list_recent_jobs_returns_newest_first_and_can_filter_by_status() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("ravel.db")).unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = store
            .add_job(NewJob {
                command: vec!["echo".to_string(), i.to_string()],
                gpus: 0,
                priority: 0,
                depends_on: Vec::new(),
                memory_tag: None,
                cwd: None,
            })
            .unwrap();
        ids.push(id);
    }

    let recent = store.list_recent_jobs(10, None).unwrap();
    let recent_ids: Vec<&str> = recent.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(recent_ids, vec![ids[2].as_str(), ids[1].as_str(), ids[0].as_str()]);
}

#[tokio::test]
async fn concurrent_claim_attempts_produce_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("ravel.db")).unwrap();
    let id = store
        .add_job(NewJob {
            command: vec!["true".to_string()],
            gpus: 0,
            priority: 0,
            depends_on: Vec::new(),
            memory_tag: None,
            cwd: None,
        })
        .unwrap();

    let store_a = store.clone();
    let store_b = store.clone();
    let id_a = id.clone();
    let id_b = id.clone();

    let (a, b) = tokio::join!(
        tokio::task::spawn_blocking(move || store_a.try_claim_job(&id_a, &[0])),
        tokio::task::spawn_blocking(move || store_b.try_claim_job(&id_b, &[1])),
    );

    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();
    assert_ne!(a, b, "exactly one of the two concurrent claims should win");

    let job = store.get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.gpus_assigned.len(), 1);
}

#[tokio::test]
async fn dispatcher_run_stops_promptly_on_shutdown_notification() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("ravel.db")).unwrap();
    let dispatcher = Dispatcher::new(store, config(dir.path(), 1));

    let wake = Arc::new(Notify::new());
    let shutdown = Arc::new(Notify::new());
    let shutdown_clone = shutdown.clone();

    let handle = tokio::spawn(async move { dispatcher.run(wake, shutdown).await });
    shutdown_clone.notify_one();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("dispatcher.run did not return promptly after shutdown")
        .unwrap()
        .unwrap();
}
