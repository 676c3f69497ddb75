//! Durable storage for job execution logs.
//!
//! The worker-side [`LogSink`](crate::worker::LogSink) writes batches through
//! [`LogStore::insert_many`]; the master reads them back with
//! [`LogStore::list_logs`], newest first.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::{ExecutionStatus, JobExecuteResult};

pub use memory::MemoryLogStore;
pub use sqlite::SqliteLogStore;

/// One persisted execution. Times are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub job_name: String,
    pub command: String,
    pub err: String,
    pub output: String,
    pub plan_time: i64,
    pub schedule_time: i64,
    pub start_time: i64,
    pub end_time: i64,
}

impl JobLog {
    pub fn from_result(result: &JobExecuteResult) -> Self {
        Self {
            job_name: result.info.job.name.clone(),
            command: result.info.job.command.clone(),
            err: result.error.clone().unwrap_or_default(),
            output: result.output.clone(),
            plan_time: result.info.plan_time.timestamp_millis(),
            schedule_time: result.info.real_time.timestamp_millis(),
            start_time: result.start_time.timestamp_millis(),
            end_time: result.end_time.timestamp_millis(),
        }
    }

    /// Whether a result is worth persisting. Lock-contention skips happen
    /// on every losing worker every tick and are not logged.
    pub fn should_record(result: &JobExecuteResult) -> bool {
        result.status != ExecutionStatus::Skipped
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Bulk insert, preserving order.
    async fn insert_many(&self, logs: Vec<JobLog>) -> Result<()>;

    /// Logs for one job, ordered by start time descending.
    async fn list_logs(&self, job_name: &str, skip: usize, limit: usize) -> Result<Vec<JobLog>>;
}
