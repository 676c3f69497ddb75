use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LogSinkConfig;
use crate::logstore::{JobLog, LogStore};

/// Counters exposed by the sink for tests and the admin API.
#[derive(Debug, Default)]
pub struct LogSinkMetrics {
    appended: AtomicU64,
    dropped: AtomicU64,
    flushed_batches: AtomicU64,
    flushed_logs: AtomicU64,
    failed_batches: AtomicU64,
    stale_timeouts: AtomicU64,
}

impl LogSinkMetrics {
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Logs refused because the sink's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn flushed_batches(&self) -> u64 {
        self.flushed_batches.load(Ordering::Relaxed)
    }

    pub fn flushed_logs(&self) -> u64 {
        self.flushed_logs.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }

    /// Commit timeouts that arrived for a batch already flushed by size.
    pub fn stale_timeouts(&self) -> u64 {
        self.stale_timeouts.load(Ordering::Relaxed)
    }
}

/// Producer handle of the log sink. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::Sender<JobLog>,
    metrics: Arc<LogSinkMetrics>,
}

impl LogSink {
    /// Create the handle and the worker that owns the batching loop.
    /// The worker does nothing until [`LogSinkWorker::run`] is spawned.
    pub fn new(store: Arc<dyn LogStore>, config: LogSinkConfig) -> (Self, LogSinkWorker) {
        let (tx, log_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (timeout_tx, timeout_rx) = mpsc::channel(16);
        let metrics = Arc::new(LogSinkMetrics::default());

        let sink = Self {
            tx,
            metrics: Arc::clone(&metrics),
        };
        let worker = LogSinkWorker {
            store,
            config,
            log_rx,
            timeout_tx,
            timeout_rx,
            batch: None,
            next_generation: 0,
            commit_timer: None,
            metrics,
        };
        (sink, worker)
    }

    /// Queue a log for persistence. Returns `false` if it was dropped
    /// because the buffer is full or the sink has stopped.
    pub fn append(&self, log: JobLog) -> bool {
        match self.tx.try_send(log) {
            Ok(()) => {
                self.metrics.appended.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(log)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(job = %log.job_name, "Log sink full, dropping job log");
                false
            }
            Err(mpsc::error::TrySendError::Closed(log)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(job = %log.job_name, "Log sink stopped, dropping job log");
                false
            }
        }
    }

    pub fn metrics(&self) -> Arc<LogSinkMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// The open batch. `generation` ties commit timeouts to the batch that
/// armed them.
#[derive(Debug)]
struct LogBatch {
    generation: u64,
    logs: Vec<JobLog>,
}

/// Batching loop behind a [`LogSink`].
///
/// A batch opens with the first log after a flush and is written when it
/// reaches `batch_size` or when its commit timeout fires, whichever comes
/// first. Each batch carries a generation id and the timer sends that id
/// back, so a timeout that races with a size flush is recognised as stale
/// and ignored instead of flushing the next batch early.
///
/// Failed writes are logged and the batch is dropped.
pub struct LogSinkWorker {
    store: Arc<dyn LogStore>,
    config: LogSinkConfig,
    log_rx: mpsc::Receiver<JobLog>,
    timeout_tx: mpsc::Sender<u64>,
    timeout_rx: mpsc::Receiver<u64>,
    batch: Option<LogBatch>,
    next_generation: u64,
    commit_timer: Option<AbortHandle>,
    metrics: Arc<LogSinkMetrics>,
}

impl LogSinkWorker {
    /// Run until `shutdown` fires or every [`LogSink`] handle is dropped.
    /// Logs already queued and the open batch are flushed before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            batch_size = self.config.batch_size,
            commit_timeout_ms = self.config.commit_timeout_ms,
            "Log sink started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                log = self.log_rx.recv() => match log {
                    Some(log) => self.handle_log(log).await,
                    None => break,
                },
                Some(generation) = self.timeout_rx.recv() => {
                    self.handle_timeout(generation).await;
                }
            }
        }

        while let Ok(log) = self.log_rx.try_recv() {
            self.handle_log(log).await;
        }
        if let Some(batch) = self.batch.take() {
            self.stop_timer();
            self.flush(batch).await;
        }
        tracing::info!("Log sink stopped");
    }

    async fn handle_log(&mut self, log: JobLog) {
        if self.batch.is_none() {
            let generation = self.next_generation;
            self.next_generation += 1;
            self.batch = Some(LogBatch {
                generation,
                logs: Vec::with_capacity(self.config.batch_size.min(1024)),
            });
            self.start_timer(generation);
        }

        let full = match self.batch.as_mut() {
            Some(batch) => {
                batch.logs.push(log);
                batch.logs.len() >= self.config.batch_size.max(1)
            }
            None => false,
        };

        if full {
            if let Some(batch) = self.batch.take() {
                self.stop_timer();
                self.flush(batch).await;
            }
        }
    }

    async fn handle_timeout(&mut self, generation: u64) {
        let current = self.batch.as_ref().map(|batch| batch.generation);
        if current != Some(generation) {
            self.metrics.stale_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(generation, current = ?current, "Ignoring stale commit timeout");
            return;
        }

        self.commit_timer = None;
        if let Some(batch) = self.batch.take() {
            self.flush(batch).await;
        }
    }

    fn start_timer(&mut self, generation: u64) {
        let tx = self.timeout_tx.clone();
        let delay = self.config.commit_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(generation).await;
        });
        self.commit_timer = Some(handle.abort_handle());
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.commit_timer.take() {
            timer.abort();
        }
    }

    async fn flush(&self, batch: LogBatch) {
        let count = batch.logs.len();
        if count == 0 {
            return;
        }

        let insert = self.store.insert_many(batch.logs);
        match tokio::time::timeout(self.config.flush_timeout(), insert).await {
            Ok(Ok(())) => {
                self.metrics.flushed_batches.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .flushed_logs
                    .fetch_add(count as u64, Ordering::Relaxed);
                tracing::debug!(generation = batch.generation, count, "Flushed job logs");
            }
            Ok(Err(e)) => {
                self.metrics.failed_batches.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    generation = batch.generation,
                    count,
                    error = %e,
                    "Failed to write job logs, batch dropped"
                );
            }
            Err(_) => {
                self.metrics.failed_batches.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    generation = batch.generation,
                    count,
                    timeout_ms = self.config.flush_timeout_ms,
                    "Timed out writing job logs, batch dropped"
                );
            }
        }
    }
}
