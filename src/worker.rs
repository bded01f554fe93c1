use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::AdmissionError;
use crate::queue::JobQueue;
use crate::sandbox::{ExecutionRequest, ExecutionResult, Orchestrator};

pub async fn worker(
    id: usize,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            job = queue.pop() => {
                if job.responder.is_closed() {
                    log::debug!("Worker {id} skipped a job whose submitter went away");
                    continue;
                }

                log::debug!("Worker {id} got a job from queue");
                let result = orchestrator.execute(&job.request).await;

                if job.responder.send(result).is_err() {
                    log::warn!("Failed to send execution result back from worker {id}");
                }
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// Fixed set of workers draining a shared bounded queue
///
/// At most `workers` sandboxes run at once; up to the queue capacity more
/// requests wait, and anything beyond that is refused.
pub struct ExecutionPool {
    queue: Arc<JobQueue>,
    workers: JoinSet<anyhow::Result<()>>,
    token: CancellationToken,
}

impl ExecutionPool {
    pub fn start(orchestrator: Arc<Orchestrator>, workers: usize, queue_capacity: usize) -> Self {
        let queue = Arc::new(JobQueue::new(queue_capacity));
        let token = CancellationToken::new();

        let mut set = JoinSet::new();
        for i in 1..=workers {
            set.spawn(worker(i, orchestrator.clone(), queue.clone(), token.clone()));
        }
        log::info!("Started {workers} execution workers, queue capacity {queue_capacity}");

        Self {
            queue,
            workers: set,
            token,
        }
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionResult, AdmissionError> {
        self.queue.submit(request).await
    }

    /// Resolves when a worker exits; workers only exit on shutdown or failure
    pub async fn join_next(&mut self) -> Option<Result<anyhow::Result<()>, JoinError>> {
        self.workers.join_next().await
    }

    /// Stops accepting work, lets running executions finish, and waits for
    /// every worker
    pub async fn shutdown(mut self) {
        let discarded = self.queue.close().await;
        if discarded > 0 {
            log::warn!("Discarded {discarded} queued executions at shutdown");
        }

        self.token.cancel();
        log::info!("Shutdown signal sent to workers, waiting for them to finish...");

        while let Some(res) = self.workers.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Worker finished with error: {e:?}"),
                Err(e) if e.is_panic() => log::error!("Worker handle panicked: {e:?}"),
                Err(e) => log::error!("Worker handle finished with error: {e:?}"),
            }
        }
    }
}
