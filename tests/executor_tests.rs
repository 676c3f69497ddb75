use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crontab_lite::config::WorkerConfig;
use crontab_lite::scheduler::{ExecutionStatus, Job, JobExecuteInfo};
use crontab_lite::store::{CoordinationStore, MemoryStore};
use crontab_lite::worker::{JobExecutor, JobLock};
use tokio::sync::mpsc;

fn test_config() -> WorkerConfig {
    WorkerConfig {
        lock_jitter_max_ms: 0,
        ..WorkerConfig::default().with_worker_id("test-worker")
    }
}

/// Create a test executor over a fresh store
fn test_executor() -> (Arc<MemoryStore>, JobExecutor) {
    let store = Arc::new(MemoryStore::new());
    let executor = JobExecutor::new(store.clone(), test_config());
    (store, executor)
}

fn info(name: &str, command: &str) -> JobExecuteInfo {
    let now = Utc::now();
    JobExecuteInfo::new(Job::new(name, command, "* * * * * *"), now, now)
}

#[tokio::test]
async fn test_execute_simple_command() {
    let (_store, executor) = test_executor();

    let result = executor.execute(info("job1", "echo hello")).await;

    assert_eq!(result.job_name(), "job1");
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output, "hello\n");
    assert!(result.error.is_none());
    assert!(result.end_time >= result.start_time);
}

#[tokio::test]
async fn test_execute_empty_output() {
    let (_store, executor) = test_executor();

    let result = executor.execute(info("job1", "true")).await;

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert!(result.output.is_empty());
}

#[tokio::test]
async fn test_execute_large_output() {
    let (_store, executor) = test_executor();

    let result = executor.execute(info("job1", "seq 1 1000")).await;

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.output.lines().count(), 1000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let (_store, executor) = test_executor();

    let result = executor.execute(info("job1", "exit 3")).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.error.as_deref(), Some("exit status: 3"));
}

#[tokio::test]
async fn test_execute_captures_stdout_and_stderr() {
    let (_store, executor) = test_executor();

    let result = executor
        .execute(info("job1", "echo out; echo 'error message' >&2; exit 1"))
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.output, "out\nerror message\n");
}

#[tokio::test]
async fn test_execute_output_keeps_write_order_across_streams() {
    let (_store, executor) = test_executor();

    let result = executor
        .execute(info("job1", "echo first >&2; sleep 0.1; echo second; echo third >&2"))
        .await;

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.output, "first\nsecond\nthird\n");
}

#[tokio::test]
async fn test_lock_released_after_execution() {
    let (store, executor) = test_executor();

    executor.execute(info("job1", "true")).await;
    executor.execute(info("job1", "exit 1")).await;

    assert!(store.get("/cron/lock/job1").await.unwrap().is_none());
    assert_eq!(store.lease_count().await, 0);
}

#[tokio::test]
async fn test_lock_held_elsewhere_skips_without_running() {
    let (store, executor) = test_executor();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let mut other = JobLock::new(store.clone(), "job1", Duration::from_secs(5));
    other.try_lock().await.unwrap();

    let result = executor
        .execute(info("job1", &format!("touch {}", marker.display())))
        .await;

    assert_eq!(result.status, ExecutionStatus::Skipped);
    assert!(!marker.exists());
    // The holder's lock is untouched
    assert!(store.get("/cron/lock/job1").await.unwrap().is_some());
    other.unlock().await;
}

#[tokio::test]
async fn test_kill_terminates_process_group() {
    let (store, executor) = test_executor();
    let job = info("job1", "sleep 30 & sleep 30; wait");
    let cancel = job.cancel.clone();

    let handle = tokio::spawn(async move { executor.execute(job).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("execution should end promptly after kill")
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.error.unwrap().contains("killed"));
    assert!(store.get("/cron/lock/job1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_kill_before_start_does_not_run() {
    let (_store, executor) = test_executor();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let job = info("job1", &format!("touch {}", marker.display()));
    job.cancel.cancel();
    let result = executor.execute(job).await;

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_spawn_reports_exactly_one_result() {
    let (_store, executor) = test_executor();
    let (tx, mut rx) = mpsc::channel(4);

    executor.spawn(info("job1", "echo spawned"), tx).await.unwrap();

    let result = rx.recv().await.unwrap();
    assert_eq!(result.output, "spawned\n");
    // Sender was dropped with the task, nothing else arrives
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_concurrent_executions_of_same_job_run_once() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let mut handles = Vec::new();

    for i in 0..5 {
        let executor = JobExecutor::new(
            store.clone(),
            test_config().with_worker_id(format!("w{}", i)),
        );
        handles.push(tokio::spawn(async move {
            executor.execute(info("job1", "sleep 0.3")).await
        }));
    }

    let mut succeeded = 0;
    let mut skipped = 0;
    for handle in handles {
        match handle.await.unwrap().status {
            ExecutionStatus::Succeeded => succeeded += 1,
            ExecutionStatus::Skipped => skipped += 1,
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(skipped, 4);
}
