use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::logstore::{JobLog, LogStore};

/// Log store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    logs: RwLock<Vec<JobLog>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.logs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.logs.read().await.is_empty()
    }

    /// Every stored log in insertion order.
    pub async fn all(&self) -> Vec<JobLog> {
        self.logs.read().await.clone()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert_many(&self, logs: Vec<JobLog>) -> Result<()> {
        self.logs.write().await.extend(logs);
        Ok(())
    }

    async fn list_logs(&self, job_name: &str, skip: usize, limit: usize) -> Result<Vec<JobLog>> {
        let logs = self.logs.read().await;
        let mut matching: Vec<&JobLog> = logs.iter().filter(|l| l.job_name == job_name).collect();
        // Stable sort keeps insertion order among equal start times
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(matching
            .into_iter()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }
}
