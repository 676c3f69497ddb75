use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::store::{CoordinationStore, JOB_WORKER_DIR};

/// Advertises a worker under `/cron/workers/<id>` for as long as it runs.
///
/// The key is bound to a lease that is kept alive every TTL/3. If a
/// keep-alive fails the worker registers again with a new lease after the
/// resync backoff. On shutdown the lease is revoked so the key disappears
/// at once.
pub struct WorkerRegistry {
    store: Arc<dyn CoordinationStore>,
    config: WorkerConfig,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    pub fn key(&self) -> String {
        format!("{}{}", JOB_WORKER_DIR, self.config.worker_id)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            match self.register_once(&shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        "Worker registration lost, registering again"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.resync_backoff()) => {}
            }
        }
    }

    /// Register and keep the lease alive. `Ok` means shutdown was requested.
    async fn register_once(&self, shutdown: &CancellationToken) -> Result<()> {
        let ttl = self.config.register_ttl();
        let lease_id = self.store.grant_lease(ttl).await?;
        if let Err(e) = self.store.put(&self.key(), Vec::new(), Some(lease_id)).await {
            let _ = self.store.revoke_lease(lease_id).await;
            return Err(e);
        }
        tracing::info!(worker_id = %self.config.worker_id, lease_id, "Worker registered");

        let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(e) = self.store.revoke_lease(lease_id).await {
                        tracing::warn!(lease_id, error = %e, "Failed to revoke worker lease");
                    }
                    tracing::info!(worker_id = %self.config.worker_id, "Worker deregistered");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.store.keep_alive_once(lease_id).await?;
                }
            }
        }
    }
}
