//! Coordination store abstraction.
//!
//! Workers and the master share job definitions, kill signals, locks and
//! liveness keys through a revisioned key-value store with leases and
//! prefix watches. [`CoordinationStore`] is the seam. [`EtcdStore`] talks to
//! an etcd cluster and is what separate master and worker processes share;
//! [`MemoryStore`] is the embedded implementation used by a single-process
//! deployment and by tests.
//!
//! # Key layout
//!
//! | Prefix            | Value                   | Lifetime             |
//! |-------------------|-------------------------|----------------------|
//! | `/cron/jobs/`     | JSON [`Job`]            | until deleted        |
//! | `/cron/killer/`   | empty                   | 1 s lease            |
//! | `/cron/lock/`     | empty                   | holder's lease       |
//! | `/cron/workers/`  | empty                   | registration lease   |
//!
//! [`Job`]: crate::scheduler::Job

pub mod etcd;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

pub const JOB_SAVE_DIR: &str = "/cron/jobs/";
pub const JOB_KILLER_DIR: &str = "/cron/killer/";
pub const JOB_LOCK_DIR: &str = "/cron/lock/";
pub const JOB_WORKER_DIR: &str = "/cron/workers/";

pub type Revision = i64;
pub type LeaseId = i64;

/// Strip a directory prefix from a key, e.g. `/cron/jobs/job1` -> `job1`.
pub fn extract_name<'a>(prefix: &str, key: &'a str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

/// Result of a prefix read, stamped with the store revision it observed.
#[derive(Debug, Clone)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

impl std::fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchEventKind::Put => write!(f, "put"),
            WatchEventKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single change. For deletes `kv.value` is empty and `kv.mod_revision`
/// is the revision of the delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValue,
}

/// Stream of watch events. The sender side is dropped when the watch is
/// lost (disconnect or a slow consumer); callers must resynchronize.
pub type WatchStream = mpsc::Receiver<WatchEvent>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse>;

    /// Put a key, optionally bound to a lease. Returns the previous value.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<KeyValue>>;

    /// Single-key transaction: create the key only if it does not exist.
    /// Returns `true` when this call created it.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool>;

    /// Delete a key. Deleting a missing key succeeds and returns `None`.
    async fn delete(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refresh a lease's TTL once. Fails with `LeaseNotFound` if it expired.
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<()>;

    /// Revoke a lease, deleting every key bound to it. Revoking an unknown
    /// lease succeeds.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Watch every key under `prefix`, replaying history from
    /// `start_revision` (inclusive).
    async fn watch(&self, prefix: &str, start_revision: Revision) -> Result<WatchStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_name_strips_prefix() {
        assert_eq!(extract_name(JOB_SAVE_DIR, "/cron/jobs/job1"), "job1");
        assert_eq!(extract_name(JOB_KILLER_DIR, "/cron/killer/a/b"), "a/b");
        assert_eq!(extract_name(JOB_LOCK_DIR, "other"), "other");
    }

    #[test]
    fn watch_event_kind_display() {
        assert_eq!(WatchEventKind::Put.to_string(), "put");
        assert_eq!(WatchEventKind::Delete.to_string(), "delete");
    }
}
