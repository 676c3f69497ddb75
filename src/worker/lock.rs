use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::store::{CoordinationStore, LeaseId, JOB_LOCK_DIR};

/// Lease-backed mutual exclusion for one job across the worker fleet.
///
/// A lock lives for a single execution attempt:
///
/// 1. [`try_lock`](Self::try_lock) grants a short lease, starts a keep-alive
///    task and tries to create `/cron/lock/<job>` bound to that lease.
/// 2. [`unlock`](Self::unlock) stops the keep-alive, revokes the lease and
///    deletes the key. It is idempotent and safe after a failed attempt.
///
/// If the holder crashes the keep-alive stops with it and the key vanishes
/// once the lease TTL runs out.
pub struct JobLock {
    store: Arc<dyn CoordinationStore>,
    job_name: String,
    ttl: Duration,
    lease_id: Option<LeaseId>,
    keep_alive: Option<CancellationToken>,
    held: bool,
}

impl JobLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        job_name: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            job_name: job_name.into(),
            ttl,
            lease_id: None,
            keep_alive: None,
            held: false,
        }
    }

    pub fn key(&self) -> String {
        format!("{}{}", JOB_LOCK_DIR, self.job_name)
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease_id
    }

    /// Single attempt; never waits for the current holder.
    ///
    /// # Errors
    ///
    /// [`CronError::LockAlreadyHeld`] when another attempt owns the key, or
    /// the store error that prevented the attempt.
    pub async fn try_lock(&mut self) -> Result<()> {
        if self.held {
            return Ok(());
        }

        let lease_id = self.store.grant_lease(self.ttl).await?;
        self.lease_id = Some(lease_id);
        self.keep_alive = Some(self.spawn_keep_alive(lease_id));

        match self.store.put_if_absent(&self.key(), Vec::new(), Some(lease_id)).await {
            Ok(true) => {
                self.held = true;
                tracing::debug!(job = %self.job_name, lease_id, "Job lock acquired");
                Ok(())
            }
            Ok(false) => {
                self.release_lease().await;
                Err(CronError::LockAlreadyHeld(self.job_name.clone()))
            }
            Err(e) => {
                self.release_lease().await;
                Err(e)
            }
        }
    }

    /// Release the lock. Calling it twice, or without a successful
    /// [`try_lock`](Self::try_lock), is a no-op.
    pub async fn unlock(&mut self) {
        if self.held {
            self.held = false;
            if let Err(e) = self.store.delete(&self.key()).await {
                tracing::warn!(job = %self.job_name, error = %e, "Failed to delete lock key");
            }
            tracing::debug!(job = %self.job_name, "Job lock released");
        }
        self.release_lease().await;
    }

    async fn release_lease(&mut self) {
        if let Some(token) = self.keep_alive.take() {
            token.cancel();
        }
        if let Some(lease_id) = self.lease_id.take() {
            if let Err(e) = self.store.revoke_lease(lease_id).await {
                // The lease still expires on its own after one TTL
                tracing::warn!(
                    job = %self.job_name,
                    lease_id,
                    error = %e,
                    "Failed to revoke lock lease"
                );
            }
        }
    }

    fn spawn_keep_alive(&self, lease_id: LeaseId) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let store = Arc::clone(&self.store);
        let job_name = self.job_name.clone();
        let period = (self.ttl / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.keep_alive_once(lease_id).await {
                            tracing::warn!(
                                job = %job_name,
                                lease_id,
                                error = %e,
                                "Lock keep-alive failed"
                            );
                            break;
                        }
                    }
                }
            }
        });

        token
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        // Without an explicit unlock the lease is left to expire
        if let Some(token) = self.keep_alive.take() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for JobLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLock")
            .field("job_name", &self.job_name)
            .field("lease_id", &self.lease_id)
            .field("held", &self.held)
            .finish()
    }
}
