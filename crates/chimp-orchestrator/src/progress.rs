//! Progress reporting for training runs.
//!
//! The dispatcher emits a [`RunEvent`] for every status change. Subscribers get
//! them over a broadcast channel; the reporter also keeps running counters that
//! back `GET /metrics/runs`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Run lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run was persisted and enqueued.
    Queued {
        run_id: String,
        plugin_name: String,
    },
    /// A worker claimed the run.
    Started {
        run_id: String,
        worker_id: String,
        attempt: u32,
    },
    /// The run finished successfully.
    Succeeded {
        run_id: String,
        worker_id: String,
        model_uri: Option<String>,
    },
    /// The run finished with a terminal failure.
    Failed {
        run_id: String,
        worker_id: String,
        error: String,
    },
    /// A transient failure put the run back in the queue.
    Retrying {
        run_id: String,
        worker_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// The worker lost its claim before recording the outcome.
    Abandoned {
        run_id: String,
        worker_id: String,
    },
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub queued: u64,
    pub started: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Broadcasts run events and keeps counters.
#[derive(Debug)]
pub struct ProgressReporter {
    broadcast_tx: broadcast::Sender<RunEvent>,
    metrics: Arc<Mutex<RunMetrics>>,
}

impl ProgressReporter {
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);
        Self { broadcast_tx, metrics: Arc::new(Mutex::new(RunMetrics::default())) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.broadcast_tx.subscribe()
    }

    pub async fn snapshot(&self) -> RunMetrics {
        *self.metrics.lock().await
    }

    pub async fn emit_queued(&self, run_id: &str, plugin_name: &str) {
        self.metrics.lock().await.queued += 1;
        self.send(RunEvent::Queued {
            run_id: run_id.to_string(),
            plugin_name: plugin_name.to_string(),
        });
    }

    pub async fn emit_started(&self, run_id: &str, worker_id: &str, attempt: u32) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.started += 1;
            metrics.running += 1;
        }
        self.send(RunEvent::Started {
            run_id: run_id.to_string(),
            worker_id: worker_id.to_string(),
            attempt,
        });
    }

    pub async fn emit_succeeded(&self, run_id: &str, worker_id: &str, model_uri: Option<String>) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.succeeded += 1;
            metrics.running = metrics.running.saturating_sub(1);
        }
        self.send(RunEvent::Succeeded {
            run_id: run_id.to_string(),
            worker_id: worker_id.to_string(),
            model_uri,
        });
    }

    pub async fn emit_failed(&self, run_id: &str, worker_id: &str, error: &str) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.failed += 1;
            metrics.running = metrics.running.saturating_sub(1);
        }
        self.send(RunEvent::Failed {
            run_id: run_id.to_string(),
            worker_id: worker_id.to_string(),
            error: error.to_string(),
        });
    }

    pub async fn emit_retrying(
        &self,
        run_id: &str,
        worker_id: &str,
        attempt: u32,
        delay: Duration,
        error: &str,
    ) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.retried += 1;
            metrics.running = metrics.running.saturating_sub(1);
        }
        self.send(RunEvent::Retrying {
            run_id: run_id.to_string(),
            worker_id: worker_id.to_string(),
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error: error.to_string(),
        });
    }

    pub async fn emit_abandoned(&self, run_id: &str, worker_id: &str) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.running = metrics.running.saturating_sub(1);
        }
        self.send(RunEvent::Abandoned {
            run_id: run_id.to_string(),
            worker_id: worker_id.to_string(),
        });
    }

    fn send(&self, event: RunEvent) {
        debug!(?event, "Progress event");
        // No subscribers is fine.
        let _ = self.broadcast_tx.send(event);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
