use std::sync::Arc;
use std::time::Duration;

use crate::error::{CronError, Result};
use crate::scheduler::Job;
use crate::store::{CoordinationStore, KeyValue, JOB_KILLER_DIR, JOB_SAVE_DIR};

/// Lifetime of a kill signal; long enough for every watcher to see the put.
const KILL_SIGNAL_TTL: Duration = Duration::from_secs(1);

/// Job CRUD and kill signalling against the coordination store.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn CoordinationStore>,
}

impl JobManager {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Validate and store a job. Returns the definition it replaced.
    pub async fn save_job(&self, job: Job) -> Result<Option<Job>> {
        job.validate()?;
        let prev = self
            .store
            .put(&job_key(&job.name), job.to_bytes()?, None)
            .await?;
        tracing::info!(job = %job.name, cron_expr = %job.cron_expr, "Job saved");
        Ok(prev.and_then(|kv| decode_previous(&kv)))
    }

    /// Delete a job. Returns the removed definition, if there was one.
    pub async fn delete_job(&self, name: &str) -> Result<Option<Job>> {
        let prev = self.store.delete(&job_key(name)).await?;
        if prev.is_some() {
            tracing::info!(job = %name, "Job deleted");
        }
        Ok(prev.and_then(|kv| decode_previous(&kv)))
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let response = self.store.get_prefix(JOB_SAVE_DIR).await?;
        let jobs = response
            .kvs
            .iter()
            .filter_map(|kv| match Job::from_bytes(&kv.value) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable job");
                    None
                }
            })
            .collect();
        Ok(jobs)
    }

    /// Ask every worker to kill the running instance of `name`.
    ///
    /// The signal is a put under `/cron/killer/` bound to a short lease, so
    /// it cleans itself up.
    pub async fn kill_job(&self, name: &str) -> Result<()> {
        if self.store.get(&job_key(name)).await?.is_none() {
            return Err(CronError::JobNotFound(name.to_string()));
        }

        let lease_id = self.store.grant_lease(KILL_SIGNAL_TTL).await?;
        self.store
            .put(&format!("{}{}", JOB_KILLER_DIR, name), Vec::new(), Some(lease_id))
            .await?;
        tracing::info!(job = %name, "Kill signal sent");
        Ok(())
    }
}

fn job_key(name: &str) -> String {
    format!("{}{}", JOB_SAVE_DIR, name)
}

fn decode_previous(kv: &KeyValue) -> Option<Job> {
    Job::from_bytes(&kv.value).ok()
}
