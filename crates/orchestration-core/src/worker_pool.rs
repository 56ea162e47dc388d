//! Fixed-size worker pool for CPU-bound in-process execution.
//!
//! Workers are long-lived tokio tasks. A caller checks one out, posts a work
//! item, and awaits the reply under the task's timeout; the worker returns
//! itself to the idle set when the handler finishes, whatever the caller
//! observed. An exhausted pool is a retryable condition, never a block on
//! the scheduler.

use crate::types::Task;
use crate::OrchestrationError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

/// Worker-side execution hook. The core never interprets payloads; the
/// handler owns task semantics.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &Task) -> Result<serde_json::Value, String>;
}

/// Outcome of one work item as observed by the caller.
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

struct WorkItem {
    task: Task,
    cancel: watch::Receiver<bool>,
    reply: oneshot::Sender<WorkOutcome>,
}

#[derive(Clone)]
struct Worker {
    id: usize,
    tx: mpsc::Sender<WorkItem>,
}

pub struct WorkerPool {
    size: usize,
    idle: Mutex<mpsc::UnboundedReceiver<Worker>>,
}

impl WorkerPool {
    pub fn new(size: usize, handler: Arc<dyn TaskHandler>) -> Arc<Self> {
        let size = size.max(1);
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();

        for id in 0..size {
            let (tx, mut rx) = mpsc::channel::<WorkItem>(1);
            let worker = Worker { id, tx };
            let handler = handler.clone();
            let idle_tx = idle_tx.clone();
            let self_handle = worker.clone();
            idle_tx.send(worker).expect("idle channel open at startup");

            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    let WorkItem {
                        task,
                        mut cancel,
                        reply,
                    } = item;
                    // A dropped cancel sender means "never cancelled".
                    let cancelled = async move {
                        loop {
                            if *cancel.borrow() {
                                return;
                            }
                            if cancel.changed().await.is_err() {
                                std::future::pending::<()>().await;
                            }
                        }
                    };
                    let outcome = tokio::select! {
                        result = handler.handle(&task) => match result {
                            Ok(value) => WorkOutcome::Completed(value),
                            Err(error) => WorkOutcome::Failed(error),
                        },
                        _ = cancelled => {
                            debug!(worker = id, task_id = %task.id, "work item cancelled");
                            WorkOutcome::Failed("cancelled".to_string())
                        }
                    };
                    // Caller may have timed out and dropped the receiver.
                    let _ = reply.send(outcome);
                    if idle_tx.send(self_handle.clone()).is_err() {
                        return;
                    }
                }
            });
        }

        Arc::new(Self {
            size,
            idle: Mutex::new(idle_rx),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Check out a worker, post the task, and wait under its timeout.
    ///
    /// Errors: `InsufficientResources` when every worker is busy (retryable),
    /// `Timeout` when the handler outlives the task's budget.
    pub async fn execute_task(
        &self,
        task: &Task,
        cancel: watch::Receiver<bool>,
    ) -> Result<WorkOutcome, OrchestrationError> {
        let worker = {
            let mut idle = self.idle.lock().await;
            match idle.try_recv() {
                Ok(worker) => worker,
                Err(_) => {
                    return Err(OrchestrationError::InsufficientResources(
                        "no available workers".to_string(),
                    ))
                }
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let item = WorkItem {
            task: task.clone(),
            cancel,
            reply: reply_tx,
        };
        if worker.tx.send(item).await.is_err() {
            // Worker task died; put nothing back and surface a retryable error.
            warn!(worker = worker.id, "worker channel closed");
            return Err(OrchestrationError::InsufficientResources(
                "worker unavailable".to_string(),
            ));
        }

        let timeout = Duration::from_millis(task.constraints.timeout_ms.max(1));
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(OrchestrationError::TransportFailure(
                "worker dropped reply".to_string(),
            )),
            Err(_) => Err(OrchestrationError::Timeout(task.constraints.timeout_ms)),
        }
    }

    /// Idle workers available right now; the pool's size minus in-flight.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}
