use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::store::{
    CoordinationStore, GetResponse, KeyValue, LeaseId, Revision, WatchEvent, WatchEventKind,
    WatchStream,
};

const DEFAULT_HISTORY_LIMIT: usize = 10_000;
const DEFAULT_WATCH_BUFFER: usize = 1024;

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: Revision,
    /// Highest revision no longer replayable from `history`.
    compacted: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease_id: LeaseId,
    history: VecDeque<WatchEvent>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    fn apply_put(
        &mut self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        history_limit: usize,
    ) -> Result<Option<KeyValue>> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(CronError::LeaseNotFound(id));
            }
        }

        let revision = self.next_revision();
        let prev = self.kvs.get(key).cloned();

        if let Some(old_lease) = prev.as_ref().and_then(|kv| kv.lease) {
            if lease != Some(old_lease) {
                if let Some(l) = self.leases.get_mut(&old_lease) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(id) = lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.insert(key.to_string());
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.as_ref().map(|kv| kv.create_revision).unwrap_or(revision),
            mod_revision: revision,
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());
        self.publish(
            WatchEvent {
                kind: WatchEventKind::Put,
                kv,
            },
            history_limit,
        );

        Ok(prev)
    }

    fn apply_delete(&mut self, key: &str, history_limit: usize) -> Option<KeyValue> {
        let prev = self.kvs.remove(key)?;
        let revision = self.next_revision();

        if let Some(id) = prev.lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.remove(key);
            }
        }

        self.publish(
            WatchEvent {
                kind: WatchEventKind::Delete,
                kv: KeyValue {
                    key: key.to_string(),
                    value: Vec::new(),
                    create_revision: prev.create_revision,
                    mod_revision: revision,
                    lease: None,
                },
            },
            history_limit,
        );

        Some(prev)
    }

    fn publish(&mut self, event: WatchEvent, history_limit: usize) {
        self.history.push_back(event.clone());
        while self.history.len() > history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.kv.mod_revision;
            }
        }

        self.watchers.retain(|w| {
            if !event.kv.key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            match w.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Dropping the sender ends the stream so the consumer resyncs
                    tracing::warn!(prefix = %w.prefix, "Watcher fell behind, disconnecting");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn expire_leases(&mut self, now: Instant, history_limit: usize) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.revoke(id, history_limit);
            tracing::debug!(lease_id = id, "Lease expired");
        }
    }

    fn revoke(&mut self, id: LeaseId, history_limit: usize) {
        if let Some(lease) = self.leases.remove(&id) {
            let mut keys: Vec<String> = lease.keys.into_iter().collect();
            keys.sort();
            for key in keys {
                self.apply_delete(&key, history_limit);
            }
        }
    }
}

/// In-process coordination store.
///
/// Every operation is linearized behind one mutex and bumps a global
/// revision, mirroring the semantics of an etcd-style store closely enough
/// for the scheduler's needs:
///
/// - leases expire lazily on every operation (and periodically when a reaper
///   is running), deleting the keys bound to them
/// - watches replay retained history from a start revision and fail with
///   [`CronError::Compacted`] when that revision is gone
/// - a watcher whose buffer overflows is disconnected instead of silently
///   losing events
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    history_limit: usize,
    watch_buffer: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_HISTORY_LIMIT, DEFAULT_WATCH_BUFFER)
    }

    pub fn with_limits(history_limit: usize, watch_buffer: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_lease_id: 1,
                ..Default::default()
            }),
            history_limit: history_limit.max(1),
            watch_buffer: watch_buffer.max(1),
        }
    }

    /// Current store revision.
    pub async fn revision(&self) -> Revision {
        self.inner.lock().await.revision
    }

    /// Number of live leases.
    pub async fn lease_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);
        inner.leases.len()
    }

    /// Drop every open watch, as a network partition would.
    pub async fn disconnect_watchers(&self) {
        let mut inner = self.inner.lock().await;
        let count = inner.watchers.len();
        inner.watchers.clear();
        tracing::info!(watchers = count, "Disconnected all watchers");
    }

    /// Expire due leases now.
    pub async fn expire_leases(&self) {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);
    }

    /// Periodically expire leases so watchers observe expiry deletes
    /// without waiting for unrelated traffic.
    pub fn spawn_lease_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => store.expire_leases().await,
                }
            }
        })
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);
        Ok(inner.kvs.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse> {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);
        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(GetResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<KeyValue>> {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);
        inner.apply_put(key, value, lease, self.history_limit)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);
        if inner.kvs.contains_key(key) {
            return Ok(false);
        }
        inner.apply_put(key, value, lease, self.history_limit)?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);
        Ok(inner.apply_delete(key, self.history_limit))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);
        let id = inner.next_lease_id;
        inner.next_lease_id += 1;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.expire_leases(now, self.history_limit);
        match inner.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = now + l.ttl;
                Ok(())
            }
            None => Err(CronError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);
        inner.revoke(lease, self.history_limit);
        Ok(())
    }

    async fn watch(&self, prefix: &str, start_revision: Revision) -> Result<WatchStream> {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now(), self.history_limit);

        if start_revision <= inner.compacted {
            return Err(CronError::Compacted {
                requested: start_revision,
                oldest: inner.compacted + 1,
            });
        }

        let replay: Vec<WatchEvent> = inner
            .history
            .iter()
            .filter(|e| e.kv.mod_revision >= start_revision && e.kv.key.starts_with(prefix))
            .cloned()
            .collect();

        let (tx, rx) = mpsc::channel(self.watch_buffer + replay.len());
        for event in replay {
            // Capacity covers the whole replay
            let _ = tx.try_send(event);
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(rx)
    }
}
