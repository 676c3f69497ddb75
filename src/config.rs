use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Settings for one worker: scheduling, locking and execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identifier registered under `/cron/workers/`.
    pub worker_id: String,
    /// Shell used to run job commands as `<shell> -c <command>`.
    pub shell: String,
    /// TTL of the per-execution lock lease.
    pub lock_ttl_ms: u64,
    /// Upper bound of the random delay before taking a job lock.
    pub lock_jitter_max_ms: u64,
    /// Period of the scheduler's due-job scan.
    pub scan_interval_ms: u64,
    /// Pause before resynchronizing after a lost watch.
    pub resync_backoff_ms: u64,
    /// TTL of the worker registration lease.
    pub register_ttl_ms: u64,
    /// Capacity of the scheduler's event and result channels.
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            shell: "/bin/bash".to_string(),
            lock_ttl_ms: 5_000,
            lock_jitter_max_ms: 1_000,
            scan_interval_ms: 1_000,
            resync_backoff_ms: 1_000,
            register_ttl_ms: 10_000,
            channel_capacity: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }

    pub fn resync_backoff(&self) -> Duration {
        Duration::from_millis(self.resync_backoff_ms)
    }

    pub fn register_ttl(&self) -> Duration {
        Duration::from_millis(self.register_ttl_ms)
    }
}

/// Batching of execution logs on the way to the log store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSinkConfig {
    /// Flush as soon as a batch holds this many logs.
    pub batch_size: usize,
    /// Flush a non-empty batch this long after it was opened.
    pub commit_timeout_ms: u64,
    /// Logs buffered ahead of the sink loop; more are dropped.
    pub channel_capacity: usize,
    /// Give up on a single bulk insert after this long.
    pub flush_timeout_ms: u64,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            commit_timeout_ms: 1_000,
            channel_capacity: 1_000,
            flush_timeout_ms: 5_000,
        }
    }
}

impl LogSinkConfig {
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: SocketAddr,
    /// Directory served for any path the API does not route.
    pub webroot: Option<PathBuf>,
    /// Requests taking longer than this are answered with 408.
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8070)),
            webroot: None,
            request_timeout_ms: 5_000,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

/// Coordination store backend. With no endpoints the node embeds its own
/// store, which only processes of this node can see.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// etcd endpoints, e.g. `http://10.0.0.1:2379`.
    pub endpoints: Vec<String>,
    pub dial_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn is_remote(&self) -> bool {
        !self.endpoints.is_empty()
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Where execution logs are persisted. Without a path logs stay in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStoreConfig {
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub log_sink: LogSinkConfig,
    pub log_store: LogStoreConfig,
    /// Admin HTTP API; disabled when absent.
    pub api: Option<ApiConfig>,
    /// Worker instances in this process. Zero runs a master-only node.
    pub worker_count: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            worker: WorkerConfig::default(),
            log_sink: LogSinkConfig::default(),
            log_store: LogStoreConfig::default(),
            api: Some(ApiConfig::default()),
            worker_count: 1,
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn with_api(mut self, listen_addr: SocketAddr) -> Self {
        let api = self.api.take().unwrap_or_default();
        self.api = Some(ApiConfig { listen_addr, ..api });
        self
    }

    pub fn without_api(mut self) -> Self {
        self.api = None;
        self
    }

    /// Config for the `index`-th worker of this node. Ids get a suffix when
    /// the node runs more than one worker.
    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        if self.worker_count <= 1 {
            return self.worker.clone();
        }
        WorkerConfig {
            worker_id: format!("{}-{}", self.worker.worker_id, index + 1),
            ..self.worker.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert!(cfg.worker_id.starts_with("worker-"));
        assert_eq!(cfg.shell, "/bin/bash");
        assert_eq!(cfg.lock_ttl(), Duration::from_secs(5));
        assert_eq!(cfg.lock_jitter_max_ms, 1_000);
        assert_eq!(cfg.scan_interval(), Duration::from_secs(1));
        assert_eq!(cfg.register_ttl(), Duration::from_secs(10));
    }

    #[test]
    fn worker_ids_are_unique_by_default() {
        assert_ne!(
            WorkerConfig::default().worker_id,
            WorkerConfig::default().worker_id
        );
    }

    #[test]
    fn log_sink_config_default() {
        let cfg = LogSinkConfig::default();
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.commit_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.channel_capacity, 1_000);
        assert_eq!(cfg.flush_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.worker_count, 1);
        assert_eq!(
            cfg.api.as_ref().unwrap().listen_addr.to_string(),
            "127.0.0.1:8070"
        );
        assert!(cfg.log_store.sqlite_path.is_none());
        assert!(!cfg.store.is_remote());
        assert_eq!(cfg.store.dial_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn node_config_from_partial_json() {
        let cfg = NodeConfig::from_json(
            r#"{
                "worker": { "worker_id": "w1", "lock_jitter_max_ms": 0 },
                "log_sink": { "batch_size": 10 },
                "log_store": { "sqlite_path": "/tmp/logs.db" },
                "worker_count": 3
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.worker.worker_id, "w1");
        assert_eq!(cfg.worker.lock_jitter_max_ms, 0);
        assert_eq!(cfg.worker.shell, "/bin/bash");
        assert_eq!(cfg.log_sink.batch_size, 10);
        assert_eq!(cfg.log_sink.commit_timeout_ms, 1_000);
        assert_eq!(
            cfg.log_store.sqlite_path,
            Some(PathBuf::from("/tmp/logs.db"))
        );
        assert_eq!(cfg.worker_count, 3);
        assert!(cfg.api.is_some());
    }

    #[test]
    fn node_config_api_toggle() {
        let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        let cfg = NodeConfig::default().with_api(addr);
        assert_eq!(cfg.api.unwrap().listen_addr, addr);
        assert!(NodeConfig::default().without_api().api.is_none());
    }

    #[test]
    fn worker_config_per_index() {
        let mut cfg = NodeConfig::default();
        cfg.worker = cfg.worker.with_worker_id("node");
        assert_eq!(cfg.worker_config(0).worker_id, "node");

        cfg.worker_count = 2;
        assert_eq!(cfg.worker_config(0).worker_id, "node-1");
        assert_eq!(cfg.worker_config(1).worker_id, "node-2");
    }

    #[test]
    fn store_and_api_sections_from_json() {
        let cfg = NodeConfig::from_json(
            r#"{
                "store": { "endpoints": ["http://10.0.0.1:2379", "http://10.0.0.2:2379"] },
                "api": { "listen_addr": "0.0.0.0:8070", "webroot": "./webroot" },
                "worker_count": 0
            }"#,
        )
        .unwrap();

        assert!(cfg.store.is_remote());
        assert_eq!(cfg.store.endpoints.len(), 2);
        assert_eq!(cfg.store.request_timeout_ms, 5_000);
        let api = cfg.api.unwrap();
        assert_eq!(api.webroot, Some(PathBuf::from("./webroot")));
        assert_eq!(api.request_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.worker_count, 0);
    }

    #[test]
    fn with_api_keeps_other_api_settings() {
        let mut cfg = NodeConfig::default();
        cfg.api = Some(ApiConfig {
            webroot: Some(PathBuf::from("/srv/web")),
            ..ApiConfig::default()
        });
        let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        let api = cfg.with_api(addr).api.unwrap();
        assert_eq!(api.listen_addr, addr);
        assert_eq!(api.webroot, Some(PathBuf::from("/srv/web")));
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "api": null }"#).unwrap();
        let cfg = NodeConfig::from_file(&path).unwrap();
        assert!(cfg.api.is_none());
    }
}
