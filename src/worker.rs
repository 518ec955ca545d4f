use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::queue::DispatchQueue;
use crate::router::{CommandRouter, DispatchOutcome};

/// Per-outcome counters across all workers.
#[derive(Debug, Default)]
pub struct DispatchStats {
    handled: AtomicU64,
    failed: AtomicU64,
    unrouted: AtomicU64,
    ignored: AtomicU64,
}

impl DispatchStats {
    fn record(&self, outcome: &DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Handled => &self.handled,
            DispatchOutcome::Failed => &self.failed,
            DispatchOutcome::Unrouted => &self.unrouted,
            DispatchOutcome::Ignored => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn unrouted(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Events taken off the queue and run to completion, whatever the outcome.
    pub fn processed(&self) -> u64 {
        self.handled() + self.failed() + self.unrouted() + self.ignored()
    }
}

/// Fixed set of tasks draining one [`DispatchQueue`].
pub struct WorkerPool {
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<DispatchQueue>,
        router: Arc<CommandRouter>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        let mut tasks = JoinSet::new();
        for worker_id in 0..count {
            tasks.spawn(worker_loop(
                worker_id,
                queue.clone(),
                router.clone(),
                stats.clone(),
            ));
        }
        info!("Started {} dispatch worker(s)", count);
        Self { tasks }
    }

    /// Wait for the workers to drain a closed queue. Workers still running
    /// after `grace` are aborted. Returns `true` if everything drained.
    ///
    /// The queue must already be closed, otherwise workers never exit.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        let drain = async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Dispatch worker ended abnormally: {}", e);
                }
            }
        };

        if tokio::time::timeout(grace, drain).await.is_ok() {
            info!("All dispatch workers drained");
            return true;
        }

        warn!(
            "Dispatch workers still busy after {:?}, aborting {} task(s)",
            grace,
            self.tasks.len()
        );
        self.tasks.shutdown().await;
        false
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<DispatchQueue>,
    router: Arc<CommandRouter>,
    stats: Arc<DispatchStats>,
) {
    debug!("Worker {} started", worker_id);
    while let Some(event) = queue.pop().await {
        let outcome = router.dispatch(&event).await;
        let latency_ms = (chrono::Utc::now() - event.received_at()).num_milliseconds();
        debug!(
            update_id = event.update_id(),
            worker_id,
            latency_ms,
            "Update processed: {:?}",
            outcome
        );
        stats.record(&outcome);
    }
    debug!("Worker {} stopped", worker_id);
}
