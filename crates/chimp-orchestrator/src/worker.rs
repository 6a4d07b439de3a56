//! Background worker pool.
//!
//! Each worker is an independent tokio task that polls the queue through the
//! shared [`JobDispatcher`] and runs one training run at a time. Workers only
//! coordinate through the dispatcher's stores, so several pools (in the same
//! or different processes) can share one queue.

use crate::dispatcher::{JobDispatcher, ProcessOutcome};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Interval for polling the queue when it is empty.
    pub poll_interval: Duration,
    /// Worker ids are `<worker_prefix>-<n>`.
    pub worker_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(500),
            worker_prefix: "worker".to_string(),
        }
    }
}

/// Pool of queue-polling workers.
pub struct WorkerPool {
    dispatcher: Arc<JobDispatcher>,
    config: WorkerPoolConfig,
    shutdown_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    #[must_use]
    pub fn new(dispatcher: Arc<JobDispatcher>, config: WorkerPoolConfig) -> Self {
        Self { dispatcher, config, shutdown_tx: None, handles: Vec::new() }
    }

    /// Ids the workers run under.
    #[must_use]
    pub fn worker_ids(&self) -> Vec<String> {
        (0..self.config.workers).map(|n| format!("{}-{n}", self.config.worker_prefix)).collect()
    }

    /// Spawns the workers.
    ///
    /// # Errors
    /// Returns an error if the pool is already running.
    pub fn start(&mut self) -> std::result::Result<(), String> {
        if self.shutdown_tx.is_some() {
            return Err("Worker pool is already running".to_string());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        for worker_id in self.worker_ids() {
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown_rx = shutdown_rx.clone();
            let poll_interval = self.config.poll_interval;
            let handle =
                tokio::spawn(worker_loop(dispatcher, worker_id, poll_interval, shutdown_rx));
            self.handles.push(handle);
        }

        info!(workers = self.config.workers, "Worker pool started");
        Ok(())
    }

    /// Signals every worker to stop and waits for in-flight runs to finish.
    pub async fn shutdown(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Processes at most one delivery as `worker_id`, outside the pool's loops.
    pub async fn run_once(&self, worker_id: &str) -> Result<ProcessOutcome> {
        self.dispatcher.process_next(worker_id).await
    }
}

async fn worker_loop(
    dispatcher: Arc<JobDispatcher>,
    worker_id: String,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id = %worker_id, "Worker started");
    let mut interval = time::interval(poll_interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                // Drain whatever is deliverable before sleeping again.
                while !*shutdown_rx.borrow() {
                    match dispatcher.process_next(&worker_id).await {
                        Ok(ProcessOutcome::Idle) => break,
                        Ok(outcome) => {
                            debug!(worker_id = %worker_id, ?outcome, "Delivery processed");
                        }
                        Err(err) => {
                            warn!(
                                worker_id = %worker_id,
                                error = %err,
                                "Queue or store error, backing off"
                            );
                            break;
                        }
                    }
                }
            }
        }
        if *shutdown_rx.borrow() {
            break;
        }
    }
    debug!(worker_id = %worker_id, "Worker stopped");
}
