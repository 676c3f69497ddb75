use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions,
    PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;

use crate::config::StoreConfig;
use crate::error::{CronError, Result};
use crate::store::{
    CoordinationStore, GetResponse, KeyValue, LeaseId, Revision, WatchEvent, WatchEventKind,
    WatchStream,
};

const WATCH_BUFFER: usize = 1024;

/// Coordination store backed by an etcd cluster.
///
/// This is what lets the master and workers run as separate processes on
/// separate machines. The client is cheap to clone; every call works on its
/// own clone since the etcd API takes `&mut self`.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the configured endpoints and check the cluster answers.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::Store`] when no endpoints are configured, or when
    /// the cluster cannot be reached within `dial_timeout_ms`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(CronError::Store("no etcd endpoints configured".to_string()));
        }

        let options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout())
            .with_timeout(config.request_timeout());
        let mut client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(store_error)?;

        // The channel connects lazily; one round-trip proves the cluster is there
        match tokio::time::timeout(config.dial_timeout(), client.status()).await {
            Ok(Ok(status)) => {
                tracing::info!(
                    endpoints = ?config.endpoints,
                    version = %status.version(),
                    "Connected to etcd"
                );
                Ok(Self { client })
            }
            Ok(Err(e)) => Err(store_error(e)),
            Err(_) => Err(CronError::Store(format!(
                "timed out connecting to etcd at {:?}",
                config.endpoints
            ))),
        }
    }
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

fn store_error(e: etcd_client::Error) -> CronError {
    CronError::Store(e.to_string())
}

fn lease_error(lease: LeaseId, e: etcd_client::Error) -> CronError {
    if is_lease_not_found(&e) {
        CronError::LeaseNotFound(lease)
    } else {
        store_error(e)
    }
}

fn is_lease_not_found(e: &etcd_client::Error) -> bool {
    e.to_string().contains("lease not found")
}

/// etcd TTLs are whole seconds; anything shorter rounds up to one.
fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: (kv.lease() != 0).then_some(kv.lease()),
    }
}

fn put_options(lease: Option<LeaseId>) -> PutOptions {
    match lease {
        Some(id) => PutOptions::new().with_lease(id),
        None => PutOptions::new(),
    }
}

fn convert_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let kind = match event.event_type() {
        EventType::Put => WatchEventKind::Put,
        EventType::Delete => WatchEventKind::Delete,
    };
    let mut kv = convert_kv(kv);
    if kind == WatchEventKind::Delete {
        kv.value.clear();
        kv.lease = None;
    }
    Some(WatchEvent { kind, kv })
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(store_error)?;
        Ok(resp.kvs().first().map(convert_kv))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_error)?;
        Ok(GetResponse {
            kvs: resp.kvs().iter().map(convert_kv).collect(),
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let options = put_options(lease).with_prev_key();
        let resp = client
            .put(key, value, Some(options))
            .await
            .map_err(|e| match lease {
                Some(id) => lease_error(id, e),
                None => store_error(e),
            })?;
        Ok(resp.prev_key().map(convert_kv))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, Some(put_options(lease)))]);
        let resp = client.txn(txn).await.map_err(|e| match lease {
            Some(id) => lease_error(id, e),
            None => store_error(e),
        })?;
        Ok(resp.succeeded())
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .delete(key, Some(DeleteOptions::new().with_prev_key()))
            .await
            .map_err(store_error)?;
        Ok(resp.prev_kvs().first().map(convert_kv))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl_seconds(ttl), None)
            .await
            .map_err(store_error)?;
        Ok(resp.id())
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| lease_error(lease, e))?;
        keeper.keep_alive().await.map_err(|e| lease_error(lease, e))?;

        match responses.message().await.map_err(|e| lease_error(lease, e))? {
            // A zero TTL means the lease already expired
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(CronError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease).await {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => Ok(()),
            Err(e) => Err(store_error(e)),
        }
    }

    async fn watch(&self, prefix: &str, start_revision: Revision) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (mut watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(store_error)?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();

        // Forwarding ends, and drops `tx`, on any loss of the etcd watch so
        // the consumer resynchronizes
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => {
                        let _ = watcher.cancel().await;
                        break;
                    }
                    message = stream.message() => message,
                };

                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        tracing::warn!(prefix = %prefix, "etcd watch stream closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(prefix = %prefix, error = %e, "etcd watch failed");
                        break;
                    }
                };

                if resp.compact_revision() > 0 {
                    tracing::warn!(
                        prefix = %prefix,
                        requested = start_revision,
                        compacted = resp.compact_revision(),
                        "Watch start revision was compacted"
                    );
                    break;
                }
                if resp.canceled() {
                    tracing::warn!(prefix = %prefix, "etcd watch canceled by server");
                    break;
                }

                for event in resp.events().iter().filter_map(convert_event) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
