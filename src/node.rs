use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::logstore::{LogStore, MemoryLogStore, SqliteLogStore};
use crate::master::{JobManager, LogManager, WorkerManager};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::store::{CoordinationStore, EtcdStore, MemoryStore};
use crate::worker::{JobExecutor, JobWatcher, LogSink, WorkerRegistry};

const LEASE_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// One process hosting the admin API and a set of workers that all compete
/// for the same jobs.
///
/// With etcd endpoints configured, any number of nodes on any number of
/// machines share one job table; a node with no workers is a plain master
/// and one without the API a plain worker. Without endpoints the node embeds
/// its coordination store.
pub struct Node {
    pub config: NodeConfig,
    store: Arc<dyn CoordinationStore>,
    /// Set when the node owns an embedded store whose leases it must reap.
    embedded: Option<Arc<MemoryStore>>,
    log_store: Arc<dyn LogStore>,
    schedulers: Vec<SchedulerHandle>,
}

impl Node {
    /// Connect to the configured coordination store and open the log store.
    ///
    /// # Errors
    ///
    /// Returns an error if etcd endpoints are configured but unreachable, or
    /// if the SQLite log store cannot be opened.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let store = if config.store.is_remote() {
            tracing::info!(endpoints = ?config.store.endpoints, "Connecting to etcd");
            let etcd = EtcdStore::connect(&config.store).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to the coordination store");
                e
            })?;
            Some(etcd)
        } else {
            None
        };

        let log_store: Arc<dyn LogStore> = match &config.log_store.sqlite_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Opening SQLite log store");
                Arc::new(SqliteLogStore::open(path).await?)
            }
            None => {
                tracing::info!("Using in-memory log store");
                Arc::new(MemoryLogStore::new())
            }
        };
        Ok(match store {
            Some(etcd) => Self::with_stores(config, Arc::new(etcd), log_store),
            None => {
                tracing::info!("Using embedded coordination store");
                Self::with_embedded_store(config, Arc::new(MemoryStore::new()), log_store)
            }
        })
    }

    /// A node over an already connected coordination store.
    pub fn with_stores(
        config: NodeConfig,
        store: Arc<dyn CoordinationStore>,
        log_store: Arc<dyn LogStore>,
    ) -> Self {
        Self {
            config,
            store,
            embedded: None,
            log_store,
            schedulers: Vec::new(),
        }
    }

    /// A node that owns `store` and expires its leases while running.
    pub fn with_embedded_store(
        config: NodeConfig,
        store: Arc<MemoryStore>,
        log_store: Arc<dyn LogStore>,
    ) -> Self {
        let mut node = Self::with_stores(config, store.clone(), log_store);
        node.embedded = Some(store);
        node
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&self.store)
    }

    pub fn api_state(&self) -> ApiState {
        let store = Arc::clone(&self.store);
        ApiState {
            jobs: JobManager::new(Arc::clone(&store)),
            logs: LogManager::new(Arc::clone(&self.log_store)),
            workers: WorkerManager::new(store),
        }
    }

    /// Handles of the schedulers started by [`run`](Self::run), in worker order.
    pub fn schedulers(&self) -> &[SchedulerHandle] {
        &self.schedulers
    }

    /// Start every subsystem and wait for `shutdown`.
    ///
    /// Subsystems started:
    /// 1. The lease reaper, when the coordination store is embedded
    /// 2. `worker_count` workers, each with registry, watcher, scheduler and
    ///    log sink
    /// 3. The admin API, when configured
    ///
    /// Returns once all of them have stopped.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = Vec::new();
        if let Some(embedded) = &self.embedded {
            tasks.push(embedded.spawn_lease_reaper(LEASE_REAP_INTERVAL, shutdown.clone()));
        }

        for index in 0..self.config.worker_count {
            tasks.extend(self.spawn_worker(index, &shutdown));
        }

        if let Some(api) = self.config.api.clone() {
            let state = self.api_state();
            let api_shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_api(api, state, api_shutdown).await {
                    tracing::error!(error = %e, "Admin API exited");
                }
            }));
        }

        tracing::info!(
            workers = self.schedulers.len(),
            api = ?self.config.api.as_ref().map(|a| a.listen_addr),
            "Node started"
        );

        shutdown.cancelled().await;
        tracing::info!("Shutting down node");
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Node task ended abnormally");
            }
        }
        tracing::info!("Node stopped");
        Ok(())
    }

    /// Wire one worker and spawn its tasks. The log sink outlives the
    /// scheduler so results collected while draining still get written.
    pub fn spawn_worker(&mut self, index: usize, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let config = self.config.worker_config(index);
        let store = Arc::clone(&self.store);

        let (sink, sink_worker) = LogSink::new(Arc::clone(&self.log_store), self.config.log_sink.clone());
        let executor = JobExecutor::new(Arc::clone(&store), config.clone());
        let (scheduler, handle) = Scheduler::new(config.clone(), executor, Some(sink));
        let watcher = JobWatcher::new(Arc::clone(&store), handle.clone(), config.clone());
        let registry = WorkerRegistry::new(store, config.clone());
        self.schedulers.push(handle);

        tracing::info!(worker_id = %config.worker_id, "Starting worker");

        let scheduler_shutdown = shutdown.clone();
        let scheduler_task = tokio::spawn(async move {
            let sink_stop = CancellationToken::new();
            let sink_task = tokio::spawn(sink_worker.run(sink_stop.clone()));
            scheduler.run(scheduler_shutdown).await;
            sink_stop.cancel();
            if let Err(e) = sink_task.await {
                tracing::warn!(error = %e, "Log sink task failed");
            }
        });

        vec![
            scheduler_task,
            tokio::spawn(watcher.run(shutdown.clone())),
            tokio::spawn(registry.run(shutdown.clone())),
        ]
    }
}
