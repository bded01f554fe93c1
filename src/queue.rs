use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, oneshot};

use crate::error::AdmissionError;
use crate::sandbox::{ExecutionRequest, ExecutionResult};

/// A request waiting for a worker, with the channel its result goes back on
pub struct ExecutionJob {
    pub request: ExecutionRequest,
    pub responder: oneshot::Sender<ExecutionResult>,
}

/// Bounded queue between callers and the execution workers
///
/// Once `capacity` jobs are pending, new submissions are refused instead of
/// piling up.
pub struct JobQueue {
    queue: Mutex<VecDeque<ExecutionJob>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn push(&self, job: ExecutionJob) -> Result<(), AdmissionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::ShuttingDown);
        }
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.capacity {
                return Err(AdmissionError::QueueFull {
                    capacity: self.capacity,
                });
            }
            queue.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn pop(&self) -> ExecutionJob {
        loop {
            if let Some(job) = self.queue.lock().await.pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    /// Queues `request` and waits for a worker to finish it
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionResult, AdmissionError> {
        let (tx, rx) = oneshot::channel();
        self.push(ExecutionJob {
            request,
            responder: tx,
        })
        .await?;

        // The sender is dropped unanswered only when the job is discarded at shutdown
        rx.await.map_err(|_| AdmissionError::ShuttingDown)
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Refuses new jobs and drops the pending ones, failing their submitters
    pub async fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut queue = self.queue.lock().await;
        let discarded = queue.len();
        queue.clear();
        discarded
    }
}
