use std::sync::Arc;

use crate::error::Result;
use crate::store::{extract_name, CoordinationStore, JOB_WORKER_DIR};

/// Lists workers that currently hold a registration lease.
#[derive(Clone)]
pub struct WorkerManager {
    store: Arc<dyn CoordinationStore>,
}

impl WorkerManager {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub async fn list_workers(&self) -> Result<Vec<String>> {
        let response = self.store.get_prefix(JOB_WORKER_DIR).await?;
        Ok(response
            .kvs
            .iter()
            .map(|kv| extract_name(JOB_WORKER_DIR, &kv.key).to_string())
            .collect())
    }
}
