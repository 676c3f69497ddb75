//! Runs against a live etcd when `CRONTAB_TEST_ETCD` names its endpoints,
//! e.g. `CRONTAB_TEST_ETCD=http://127.0.0.1:2379 cargo test --test etcd_tests`.
//! Every test is a no-op otherwise.

use std::sync::Arc;
use std::time::Duration;

use crontab_lite::config::StoreConfig;
use crontab_lite::error::CronError;
use crontab_lite::store::{CoordinationStore, EtcdStore, WatchEventKind};
use crontab_lite::worker::JobLock;

async fn connect() -> Option<Arc<dyn CoordinationStore>> {
    let endpoints = std::env::var("CRONTAB_TEST_ETCD").ok()?;
    let config = StoreConfig {
        endpoints: endpoints.split(',').map(str::to_string).collect(),
        ..StoreConfig::default()
    };
    Some(Arc::new(EtcdStore::connect(&config).await.unwrap()))
}

fn unique(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_put_get_delete_round() {
    let Some(store) = connect().await else { return };
    let key = unique("/crontab-test/kv/");

    assert!(store.put(&key, b"v1".to_vec(), None).await.unwrap().is_none());
    let prev = store.put(&key, b"v2".to_vec(), None).await.unwrap().unwrap();
    assert_eq!(prev.value, b"v1");
    assert_eq!(store.get(&key).await.unwrap().unwrap().value, b"v2");

    let deleted = store.delete(&key).await.unwrap().unwrap();
    assert_eq!(deleted.value, b"v2");
    assert!(store.delete(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_lock_contention_and_release() {
    let Some(store) = connect().await else { return };
    let job = unique("job-");

    let mut first = JobLock::new(store.clone(), job.clone(), Duration::from_secs(5));
    let mut second = JobLock::new(store.clone(), job.clone(), Duration::from_secs(5));
    first.try_lock().await.unwrap();
    assert!(matches!(
        second.try_lock().await,
        Err(CronError::LockAlreadyHeld(_))
    ));

    first.unlock().await;
    second.try_lock().await.unwrap();
    second.unlock().await;
}

#[tokio::test]
async fn test_revoked_lease_removes_keys_and_is_idempotent() {
    let Some(store) = connect().await else { return };
    let key = unique("/crontab-test/lease/");

    let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
    store.put(&key, Vec::new(), Some(lease)).await.unwrap();
    store.keep_alive_once(lease).await.unwrap();

    store.revoke_lease(lease).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_none());
    store.revoke_lease(lease).await.unwrap();
    assert!(store.keep_alive_once(lease).await.is_err());
}

#[tokio::test]
async fn test_watch_replays_from_revision() {
    let Some(store) = connect().await else { return };
    let prefix = unique("/crontab-test/watch/") + "/";

    let start = store.get_prefix(&prefix).await.unwrap().revision + 1;
    store.put(&format!("{}a", prefix), b"1".to_vec(), None).await.unwrap();
    store.delete(&format!("{}a", prefix)).await.unwrap();

    let mut events = store.watch(&prefix, start).await.unwrap();
    let put = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(put.kind, WatchEventKind::Put);
    assert_eq!(put.kv.value, b"1");

    let delete = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delete.kind, WatchEventKind::Delete);
    assert!(delete.kv.mod_revision > put.kv.mod_revision);
}
