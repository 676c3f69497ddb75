//! Master-side management of jobs, logs and workers.
//!
//! The master never schedules anything itself. It writes job definitions
//! and kill signals into the coordination store, where every worker's
//! watcher picks them up, and reads back execution logs and the set of
//! registered workers.

pub mod job_mgr;
pub mod log_mgr;
pub mod worker_mgr;

pub use job_mgr::JobManager;
pub use log_mgr::LogManager;
pub use worker_mgr::WorkerManager;
