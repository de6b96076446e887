//! Several poll loops in one process.

use std::sync::Arc;

use extask_core::WorkerId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::WorkerError;
use crate::metrics::{MetricsSnapshot, WorkerMetrics};
use crate::scheduler::{PollLoop, RunSummary};

struct Member {
    worker_id: WorkerId,
    metrics: Arc<WorkerMetrics>,
    join: JoinHandle<Result<RunSummary, WorkerError>>,
}

/// Poll loops sharing one shutdown token.
///
/// Each loop keeps its own identity, topics and counters; nothing is shared
/// between them except what their clients share.
pub struct WorkerPool {
    shutdown: CancellationToken,
    members: Vec<Member>,
}

impl WorkerPool {
    /// Spawn every loop onto the runtime.
    pub fn spawn(loops: Vec<PollLoop>, shutdown: CancellationToken) -> Self {
        let members = loops
            .into_iter()
            .map(|poll_loop| {
                let worker_id = poll_loop.worker_id().clone();
                let metrics = poll_loop.metrics();
                let join = tokio::spawn(poll_loop.run(shutdown.clone()));
                Member {
                    worker_id,
                    metrics,
                    join,
                }
            })
            .collect::<Vec<_>>();

        info!(workers = members.len(), "Worker pool started");
        Self { shutdown, members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Live counters of every loop, for the metrics endpoint.
    pub fn metrics(&self) -> MetricsSource {
        MetricsSource(Arc::new(
            self.members
                .iter()
                .map(|m| (m.worker_id.clone(), m.metrics.clone()))
                .collect(),
        ))
    }

    /// Ask every loop to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every loop to return.
    pub async fn join(self) -> Vec<(WorkerId, Result<RunSummary, WorkerError>)> {
        let mut results = Vec::with_capacity(self.members.len());
        for member in self.members {
            let result = match member.join.await {
                Ok(result) => result,
                Err(err) => Err(WorkerError::Join(err.to_string())),
            };
            results.push((member.worker_id, result));
        }
        results
    }

    /// Stop every loop and wait for them.
    pub async fn shutdown_and_join(self) -> Vec<(WorkerId, Result<RunSummary, WorkerError>)> {
        self.request_shutdown();
        self.join().await
    }
}

/// Shared, read-only view of the pool's counters.
#[derive(Clone, Default)]
pub struct MetricsSource(Arc<Vec<(WorkerId, Arc<WorkerMetrics>)>>);

impl MetricsSource {
    pub fn snapshot(&self) -> Vec<(WorkerId, MetricsSnapshot)> {
        self.0
            .iter()
            .map(|(id, metrics)| (id.clone(), metrics.snapshot()))
            .collect()
    }
}
