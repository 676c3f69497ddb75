use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Revision {requested} has been compacted, oldest available is {oldest}")]
    Compacted { requested: i64, oldest: i64 },

    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("Lock already held for job: {0}")]
    LockAlreadyHeld(String),

    #[error("Invalid cron expression for job {job}: {reason}")]
    InvalidCronExpr { job: String, reason: String },

    #[error("Invalid job definition: {0}")]
    InvalidJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Watch stream lost: {0}")]
    WatchLost(String),

    #[error("Log store error: {0}")]
    LogStore(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CronError>;
