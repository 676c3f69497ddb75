//! Worker-side runtime.
//!
//! Every worker sees every job; the pieces here make sure each fire runs on
//! at most one of them:
//!
//! - [`JobWatcher`]: mirrors `/cron/jobs/` into the scheduler and relays
//!   kill signals
//! - [`JobExecutor`]: runs a due job under its [`JobLock`] and reports the
//!   result
//! - [`JobLock`]: lease-backed, create-if-absent lock per job
//! - [`LogSink`]: batches execution logs on their way to the log store
//! - [`WorkerRegistry`]: advertises the worker under `/cron/workers/`
//!
//! # Execution Flow
//!
//! 1. The scheduler finds a due job with no execution in flight
//! 2. [`JobExecutor::spawn`] waits a random jitter and takes the job lock
//! 3. The winner runs `<shell> -c <command>`; losers report `Skipped`
//! 4. The result goes back to the scheduler, which forwards a log to the
//!    [`LogSink`]

pub mod executor;
pub mod lock;
pub mod log_sink;
pub mod register;
pub mod watcher;

pub use executor::JobExecutor;
pub use lock::JobLock;
pub use log_sink::{LogSink, LogSinkMetrics, LogSinkWorker};
pub use register::WorkerRegistry;
pub use watcher::JobWatcher;
