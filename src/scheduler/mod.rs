//! Cron scheduling loop for one worker.
//!
//! The [`Scheduler`] is the single owner of the job plan and of the table of
//! in-flight executions. Everything else talks to it through a
//! [`SchedulerHandle`]:
//!
//! - the job watcher pushes [`JobEvent`]s and full resyncs
//! - executor tasks push [`JobExecuteResult`]s
//! - tests and the node ask for a [`SchedulerSnapshot`]
//!
//! On every wake-up the loop dispatches each due job to the
//! [`JobExecutor`](crate::worker::JobExecutor), at most one execution per job
//! name, and moves the job's next fire time forward from now. A job still
//! running at its next fire time is skipped for that tick.

pub mod job;
pub mod plan;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{CronError, Result};
use crate::logstore::JobLog;
use crate::worker::{JobExecutor, LogSink};

pub use job::{
    ExecutionStatus, Job, JobEvent, JobExecuteInfo, JobExecuteResult, JobSchedulePlan,
};
pub use plan::{ExecutingTable, SchedulePlan, UpsertOutcome};

/// Counters kept by the scheduler loop.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    dispatched: AtomicU64,
    skipped_in_flight: AtomicU64,
    lock_skipped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

impl SchedulerMetrics {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Fires skipped because the previous execution was still running.
    pub fn skipped_in_flight(&self) -> u64 {
        self.skipped_in_flight.load(Ordering::Relaxed)
    }

    /// Executions that lost the job lock to another worker.
    pub fn lock_skipped(&self) -> u64 {
        self.lock_skipped.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Job definitions refused at upsert, e.g. for a bad cron expression.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Results received, whatever their status.
    pub fn completed(&self) -> u64 {
        self.succeeded() + self.failed() + self.cancelled() + self.lock_skipped()
    }
}

/// One row of the schedule plan as seen by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub job: Job,
    pub next_time: Option<DateTime<Utc>>,
}

/// Point-in-time view of the scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    /// Names of all planned jobs, sorted.
    pub planned: Vec<String>,
    /// Full plan entries, in the order of `planned`.
    pub entries: Vec<PlanEntry>,
    /// Names of jobs with an execution in flight, sorted.
    pub executing: Vec<String>,
    pub next_wakeup: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum SchedulerMessage {
    Event(JobEvent),
    Resync(Vec<Job>),
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
}

/// Sending side of the scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    msg_tx: mpsc::Sender<SchedulerMessage>,
    result_tx: mpsc::Sender<JobExecuteResult>,
    metrics: Arc<SchedulerMetrics>,
}

impl SchedulerHandle {
    pub async fn push_job_event(&self, event: JobEvent) -> Result<()> {
        self.send(SchedulerMessage::Event(event)).await
    }

    pub async fn push_job_result(&self, result: JobExecuteResult) -> Result<()> {
        self.result_tx
            .send(result)
            .await
            .map_err(|_| CronError::Internal("scheduler stopped".to_string()))
    }

    /// Replace the job table with `jobs`. Unchanged jobs keep their next
    /// fire time; jobs missing from `jobs` are dropped.
    pub async fn resync(&self, jobs: Vec<Job>) -> Result<()> {
        self.send(SchedulerMessage::Resync(jobs)).await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerMessage::Snapshot(tx)).await?;
        rx.await
            .map_err(|_| CronError::Internal("scheduler stopped".to_string()))
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.metrics)
    }

    async fn send(&self, msg: SchedulerMessage) -> Result<()> {
        self.msg_tx
            .send(msg)
            .await
            .map_err(|_| CronError::Internal("scheduler stopped".to_string()))
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("metrics", &self.metrics)
            .finish()
    }
}

pub struct Scheduler {
    config: WorkerConfig,
    plan: SchedulePlan,
    executing: ExecutingTable,
    executor: JobExecutor,
    log_sink: Option<LogSink>,
    msg_rx: mpsc::Receiver<SchedulerMessage>,
    result_rx: mpsc::Receiver<JobExecuteResult>,
    result_tx: mpsc::Sender<JobExecuteResult>,
    metrics: Arc<SchedulerMetrics>,
}

impl Scheduler {
    pub fn new(
        config: WorkerConfig,
        executor: JobExecutor,
        log_sink: Option<LogSink>,
    ) -> (Self, SchedulerHandle) {
        let capacity = config.channel_capacity.max(1);
        let (msg_tx, msg_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);
        let metrics = Arc::new(SchedulerMetrics::default());

        let handle = SchedulerHandle {
            msg_tx,
            result_tx: result_tx.clone(),
            metrics: Arc::clone(&metrics),
        };
        let scheduler = Self {
            config,
            plan: SchedulePlan::new(),
            executing: ExecutingTable::new(),
            executor,
            log_sink,
            msg_rx,
            result_rx,
            result_tx,
            metrics,
        };
        (scheduler, handle)
    }

    /// Run the loop until `shutdown` fires.
    ///
    /// The loop sleeps until the earliest planned fire time, capped at the
    /// scan interval. On shutdown every in-flight execution is cancelled and
    /// their results are collected for up to one lock TTL.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.config.worker_id, "Scheduler started");

        loop {
            let delay = self.next_scan_delay(Utc::now());

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(msg) = self.msg_rx.recv() => {
                    self.handle_message(msg);
                    self.scan(Utc::now());
                }
                Some(result) = self.result_rx.recv() => {
                    self.handle_result(result);
                }
                _ = tokio::time::sleep(delay) => {
                    self.scan(Utc::now());
                }
            }
        }

        self.drain().await;
        tracing::info!(worker_id = %self.config.worker_id, "Scheduler stopped");
    }

    fn next_scan_delay(&self, now: DateTime<Utc>) -> Duration {
        let scan = self.config.scan_interval();
        match self.plan.next_wakeup() {
            Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO).min(scan),
            None => scan,
        }
    }

    fn handle_message(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Event(event) => self.handle_event(event, Utc::now()),
            SchedulerMessage::Resync(jobs) => self.handle_resync(jobs, Utc::now()),
            SchedulerMessage::Snapshot(reply) => {
                let _ = reply.send(SchedulerSnapshot {
                    planned: self.plan.names(),
                    entries: self.plan.entries(),
                    executing: self.executing.names(),
                    next_wakeup: self.plan.next_wakeup(),
                });
            }
        }
    }

    fn handle_event(&mut self, event: JobEvent, now: DateTime<Utc>) {
        match event {
            JobEvent::Save(job) => self.upsert(job, now),
            JobEvent::Delete(name) => {
                if self.plan.remove(&name).is_some() {
                    tracing::info!(job = %name, "Job removed from schedule");
                }
            }
            JobEvent::Kill(name) => {
                if self.executing.cancel(&name) {
                    tracing::info!(job = %name, "Killing running job");
                } else {
                    tracing::debug!(job = %name, "Kill for job not running here");
                }
            }
        }
    }

    fn upsert(&mut self, job: Job, now: DateTime<Utc>) {
        let name = job.name.clone();
        match self.plan.upsert(job, now) {
            Ok(UpsertOutcome::Inserted) => {
                tracing::info!(
                    job = %name,
                    next_time = ?self.plan.get(&name).and_then(|p| p.next_time),
                    "Job scheduled"
                );
            }
            Ok(UpsertOutcome::Updated) => {
                tracing::info!(
                    job = %name,
                    next_time = ?self.plan.get(&name).and_then(|p| p.next_time),
                    "Job updated"
                );
            }
            Ok(UpsertOutcome::Unchanged) => {}
            Err(e) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(job = %name, error = %e, "Rejecting job");
            }
        }
    }

    fn handle_resync(&mut self, jobs: Vec<Job>, now: DateTime<Utc>) {
        let names: Vec<&str> = jobs.iter().map(|job| job.name.as_str()).collect();
        let removed = self.plan.retain_names(&names);
        for name in &removed {
            tracing::info!(job = %name, "Job removed from schedule during resync");
        }

        let total = jobs.len();
        for job in jobs {
            self.upsert(job, now);
        }
        tracing::info!(
            worker_id = %self.config.worker_id,
            jobs = total,
            planned = self.plan.len(),
            removed = removed.len(),
            "Job table resynchronized"
        );
    }

    fn scan(&mut self, now: DateTime<Utc>) {
        for (job, plan_time) in self.plan.take_due(now) {
            let info = JobExecuteInfo::new(job, plan_time, now);
            if !self.executing.try_begin(&info) {
                self.metrics.skipped_in_flight.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job = %info.job.name, "Previous run still in flight, skipping");
                continue;
            }

            self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job = %info.job.name, plan_time = %plan_time, "Dispatching job");
            self.executor.spawn(info, self.result_tx.clone());
        }
    }

    fn handle_result(&mut self, result: JobExecuteResult) {
        self.executing.finish(result.job_name());

        let counter = match result.status {
            ExecutionStatus::Succeeded => &self.metrics.succeeded,
            ExecutionStatus::Failed => &self.metrics.failed,
            ExecutionStatus::Cancelled => &self.metrics.cancelled,
            ExecutionStatus::Skipped => &self.metrics.lock_skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(sink) = &self.log_sink {
            if JobLog::should_record(&result) {
                sink.append(JobLog::from_result(&result));
            }
        }
    }

    async fn drain(&mut self) {
        if self.executing.is_empty() {
            return;
        }
        tracing::info!(
            running = self.executing.len(),
            "Cancelling running jobs before shutdown"
        );
        self.executing.cancel_all();

        let deadline = tokio::time::Instant::now() + self.config.lock_ttl();
        while !self.executing.is_empty() {
            match tokio::time::timeout_at(deadline, self.result_rx.recv()).await {
                Ok(Some(result)) => self.handle_result(result),
                Ok(None) | Err(_) => break,
            }
        }
        if !self.executing.is_empty() {
            tracing::warn!(
                running = self.executing.len(),
                "Jobs still running at shutdown"
            );
        }
    }
}
