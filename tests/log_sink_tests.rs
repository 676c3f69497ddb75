use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crontab_lite::config::LogSinkConfig;
use crontab_lite::error::Result;
use crontab_lite::logstore::{JobLog, LogStore, SqliteLogStore};
use crontab_lite::worker::LogSink;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Records every bulk insert it receives
#[derive(Default)]
struct RecordingLogStore {
    inserts: Mutex<Vec<Vec<JobLog>>>,
    delay: Duration,
}

#[async_trait]
impl LogStore for RecordingLogStore {
    async fn insert_many(&self, logs: Vec<JobLog>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inserts.lock().await.push(logs);
        Ok(())
    }

    async fn list_logs(&self, _job_name: &str, _skip: usize, _limit: usize) -> Result<Vec<JobLog>> {
        Ok(Vec::new())
    }
}

fn log(name: &str, start_time: i64) -> JobLog {
    JobLog {
        job_name: name.to_string(),
        command: "echo hi".to_string(),
        err: String::new(),
        output: "hi\n".to_string(),
        plan_time: start_time,
        schedule_time: start_time,
        start_time,
        end_time: start_time + 5,
    }
}

#[tokio::test]
async fn test_size_threshold_flushes_one_batch() {
    let store = Arc::new(RecordingLogStore::default());
    let config = LogSinkConfig {
        batch_size: 2,
        commit_timeout_ms: 300,
        ..LogSinkConfig::default()
    };
    let (sink, worker) = LogSink::new(store.clone(), config);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(worker.run(shutdown.clone()));

    sink.append(log("a", 1));
    sink.append(log("a", 2));

    // Past the commit timeout: the aborted timer must not cause a second write
    tokio::time::sleep(Duration::from_millis(600)).await;
    {
        let inserts = store.inserts.lock().await;
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].len(), 2);
        assert_eq!(inserts[0][0].start_time, 1);
        assert_eq!(inserts[0][1].start_time, 2);
    }

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_timeout_flushes_partial_batch_in_order() {
    let store = Arc::new(RecordingLogStore::default());
    let config = LogSinkConfig {
        batch_size: 100,
        commit_timeout_ms: 100,
        ..LogSinkConfig::default()
    };
    let (sink, worker) = LogSink::new(store.clone(), config);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(worker.run(shutdown.clone()));

    for i in 0..5 {
        sink.append(log("a", i));
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let inserts = store.inserts.lock().await.clone();
    assert_eq!(inserts.len(), 1);
    let order: Vec<i64> = inserts[0].iter().map(|l| l.start_time).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_slow_store_hits_flush_timeout() {
    let store = Arc::new(RecordingLogStore {
        delay: Duration::from_secs(5),
        ..RecordingLogStore::default()
    });
    let config = LogSinkConfig {
        batch_size: 1,
        flush_timeout_ms: 100,
        ..LogSinkConfig::default()
    };
    let (sink, worker) = LogSink::new(store.clone(), config);
    let metrics = sink.metrics();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(worker.run(shutdown.clone()));

    sink.append(log("a", 1));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(metrics.failed_batches(), 1);
    assert!(store.inserts.lock().await.is_empty());

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_sink_into_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteLogStore::open(dir.path().join("logs.db")).await.unwrap());
    let config = LogSinkConfig {
        batch_size: 3,
        ..LogSinkConfig::default()
    };
    let (sink, worker) = LogSink::new(store.clone(), config);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(worker.run(shutdown.clone()));

    for i in 0..4 {
        sink.append(log("job1", i));
    }
    // Three go out by size, the last one with the shutdown flush
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    task.await.unwrap();

    let logs = store.list_logs("job1", 0, 10).await.unwrap();
    let starts: Vec<i64> = logs.iter().map(|l| l.start_time).collect();
    assert_eq!(starts, vec![3, 2, 1, 0]);
}
