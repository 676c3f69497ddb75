use std::sync::Arc;

use crate::error::Result;
use crate::logstore::{JobLog, LogStore};

/// Largest page the API hands out in one request.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// Read access to execution logs.
#[derive(Clone)]
pub struct LogManager {
    store: Arc<dyn LogStore>,
}

impl LogManager {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    /// Newest logs of `job_name` first; `limit` is capped at [`MAX_PAGE_SIZE`].
    pub async fn list_logs(&self, job_name: &str, skip: usize, limit: usize) -> Result<Vec<JobLog>> {
        self.store
            .list_logs(job_name, skip, limit.min(MAX_PAGE_SIZE))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstore::MemoryLogStore;

    fn log(name: &str, start_time: i64) -> JobLog {
        JobLog {
            job_name: name.to_string(),
            command: "true".to_string(),
            err: String::new(),
            output: String::new(),
            plan_time: start_time,
            schedule_time: start_time,
            start_time,
            end_time: start_time + 1,
        }
    }

    #[tokio::test]
    async fn pages_newest_first() {
        let store = Arc::new(MemoryLogStore::new());
        store
            .insert_many(vec![log("a", 1), log("a", 3), log("b", 2), log("a", 2)])
            .await
            .unwrap();
        let mgr = LogManager::new(store);

        let page: Vec<i64> = mgr
            .list_logs("a", 0, 2)
            .await
            .unwrap()
            .iter()
            .map(|l| l.start_time)
            .collect();
        assert_eq!(page, vec![3, 2]);

        let rest = mgr.list_logs("a", 2, 20).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].start_time, 1);
    }
}
