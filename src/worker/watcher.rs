use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{CronError, Result};
use crate::scheduler::{Job, JobEvent, SchedulerHandle};
use crate::store::{
    extract_name, CoordinationStore, KeyValue, Revision, WatchEvent, WatchEventKind,
    JOB_KILLER_DIR, JOB_SAVE_DIR,
};

/// Keeps a scheduler's job table in step with `/cron/jobs/` and relays kill
/// signals from `/cron/killer/`.
///
/// Each sync round reads the full job set, hands it to the scheduler as a
/// resync and then follows both prefixes from the snapshot revision. When
/// either watch is lost (store disconnect, slow consumer or a compacted
/// start revision) the round ends and a fresh one starts after a backoff,
/// so no change is ever applied across a gap.
pub struct JobWatcher {
    store: Arc<dyn CoordinationStore>,
    scheduler: SchedulerHandle,
    config: WorkerConfig,
}

impl JobWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        scheduler: SchedulerHandle,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            match self.sync_round(&shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        "Job watch lost, resynchronizing"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.resync_backoff()) => {}
            }
        }
        tracing::info!(worker_id = %self.config.worker_id, "Job watcher stopped");
    }

    /// Read every job and replace the scheduler's table with them. Returns
    /// the store revision the read observed.
    pub async fn bootstrap(&self) -> Result<Revision> {
        let response = self.store.get_prefix(JOB_SAVE_DIR).await?;
        let jobs: Vec<Job> = response.kvs.iter().filter_map(decode_job).collect();

        tracing::info!(
            worker_id = %self.config.worker_id,
            jobs = jobs.len(),
            revision = response.revision,
            "Loaded job snapshot"
        );
        self.scheduler.resync(jobs).await?;
        Ok(response.revision)
    }

    /// One snapshot-then-watch round. `Ok` means shutdown was requested.
    async fn sync_round(&self, shutdown: &CancellationToken) -> Result<()> {
        let revision = self.bootstrap().await?;
        let mut jobs = self.store.watch(JOB_SAVE_DIR, revision + 1).await?;
        let mut killer = self.store.watch(JOB_KILLER_DIR, revision + 1).await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = jobs.recv() => match event {
                    Some(event) => self.forward(event).await?,
                    None => return Err(CronError::WatchLost(JOB_SAVE_DIR.to_string())),
                },
                event = killer.recv() => match event {
                    Some(event) => self.forward(event).await?,
                    None => return Err(CronError::WatchLost(JOB_KILLER_DIR.to_string())),
                },
            }
        }
    }

    async fn forward(&self, event: WatchEvent) -> Result<()> {
        if let Some(job_event) = to_job_event(&event) {
            tracing::debug!(
                job = %job_event.job_name(),
                kind = %event.kind,
                revision = event.kv.mod_revision,
                "Job change"
            );
            self.scheduler.push_job_event(job_event).await?;
        }
        Ok(())
    }
}

/// Translate a raw watch event into a scheduler event. Killer deletes (lease
/// expiry) and undecodable job values yield `None`.
pub fn to_job_event(event: &WatchEvent) -> Option<JobEvent> {
    let key = event.kv.key.as_str();
    if key.starts_with(JOB_SAVE_DIR) {
        match event.kind {
            WatchEventKind::Put => decode_job(&event.kv).map(JobEvent::Save),
            WatchEventKind::Delete => Some(JobEvent::Delete(
                extract_name(JOB_SAVE_DIR, key).to_string(),
            )),
        }
    } else if key.starts_with(JOB_KILLER_DIR) {
        match event.kind {
            WatchEventKind::Put => Some(JobEvent::Kill(
                extract_name(JOB_KILLER_DIR, key).to_string(),
            )),
            WatchEventKind::Delete => None,
        }
    } else {
        None
    }
}

fn decode_job(kv: &KeyValue) -> Option<Job> {
    let name = extract_name(JOB_SAVE_DIR, &kv.key);
    match Job::from_bytes(&kv.value) {
        Ok(mut job) => {
            if job.name != name {
                tracing::warn!(key = %kv.key, job = %job.name, "Job name differs from key, using key");
                job.name = name.to_string();
            }
            Some(job)
        }
        Err(e) => {
            tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable job");
            None
        }
    }
}
