use std::sync::Arc;
use std::time::Duration;

use crontab_lite::config::NodeConfig;
use crontab_lite::logstore::{LogStore, MemoryLogStore};
use crontab_lite::master::{JobManager, WorkerManager};
use crontab_lite::node::Node;
use crontab_lite::scheduler::Job;
use crontab_lite::store::{CoordinationStore, MemoryStore};
use tokio_util::sync::CancellationToken;

fn test_config(workers: usize) -> NodeConfig {
    let mut config = NodeConfig::default().without_api();
    config.worker = config.worker.with_worker_id("node");
    config.worker.lock_jitter_max_ms = 0;
    config.worker_count = workers;
    config.log_sink.batch_size = 1;
    config
}

#[tokio::test]
async fn test_node_runs_jobs_once_per_tick_across_workers() {
    let store = Arc::new(MemoryStore::new());
    let log_store = Arc::new(MemoryLogStore::new());
    let node = Node::with_embedded_store(test_config(3), store.clone(), log_store.clone());
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(node.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let workers = WorkerManager::new(store.clone()).list_workers().await.unwrap();
    assert_eq!(workers, vec!["node-1", "node-2", "node-3"]);

    JobManager::new(store.clone())
        .save_job(Job::new("job1", "sleep 0.3; echo done", "* * * * * *"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(3_000)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("node should stop")
        .unwrap()
        .unwrap();

    let logs = log_store.list_logs("job1", 0, 100).await.unwrap();
    assert!(!logs.is_empty());
    let mut plan_times: Vec<i64> = logs.iter().map(|l| l.plan_time).collect();
    plan_times.sort();
    plan_times.dedup();
    assert_eq!(plan_times.len(), logs.len());

    // Registrations are revoked on shutdown
    assert!(WorkerManager::new(store).list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_node_with_sqlite_log_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(1);
    config.log_store.sqlite_path = Some(dir.path().join("logs.db"));

    let node = Node::new(config).await.unwrap();
    let jobs = node.api_state().jobs;
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(node.run(shutdown.clone()));

    jobs.save_job(Job::new("job1", "echo persisted", "* * * * * *"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    let store = crontab_lite::logstore::SqliteLogStore::open(dir.path().join("logs.db"))
        .await
        .unwrap();
    let logs = store.list_logs("job1", 0, 10).await.unwrap();
    assert!(!logs.is_empty());
    assert_eq!(logs[0].output, "persisted\n");
}

#[tokio::test]
async fn test_node_fails_when_coordination_store_unreachable() {
    let mut config = test_config(1);
    config.store.endpoints = vec!["http://127.0.0.1:1".to_string()];
    config.store.dial_timeout_ms = 500;

    let result = tokio::time::timeout(Duration::from_secs(10), Node::new(config))
        .await
        .expect("startup should give up within the dial timeout");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_master_and_worker_nodes_share_a_store() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let log_store = Arc::new(MemoryLogStore::new());
    let shutdown = CancellationToken::new();

    // Master: API state only, no workers
    let master = Node::with_stores(test_config(0), store.clone(), log_store.clone());
    let jobs = master.api_state().jobs;
    let master_task = tokio::spawn(master.run(shutdown.clone()));

    let mut worker_config = test_config(1);
    worker_config.worker = worker_config.worker.with_worker_id("remote");
    let worker = Node::with_stores(worker_config, store.clone(), log_store.clone());
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));

    jobs.save_job(Job::new("job1", "echo remote", "* * * * * *"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        WorkerManager::new(store.clone()).list_workers().await.unwrap(),
        vec!["remote"]
    );
    tokio::time::sleep(Duration::from_millis(2_200)).await;

    shutdown.cancel();
    master_task.await.unwrap().unwrap();
    worker_task.await.unwrap().unwrap();

    let logs = log_store.list_logs("job1", 0, 10).await.unwrap();
    assert!(!logs.is_empty());
    assert_eq!(logs[0].output, "remote\n");
}
