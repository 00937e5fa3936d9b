//! WorkerAllocator: the single background loop that hands idle workers to
//! whichever build needs them next.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::scheduler::{BuildScheduler, SchedulerPool};
use crate::worker::{Worker, WorkerTransport};

const TRACING_TARGET: &str = "clusterrunner_core::allocator";

/// A dedupe-on-insert queue of idle workers: re-adding a worker already
/// queued is a no-op, preventing duplicate allocation attempts.
struct IdleWorkers<T: WorkerTransport> {
    queue: Mutex<VecDeque<Arc<Worker<T>>>>,
    queued_ids: Mutex<std::collections::HashSet<u32>>,
    notify: Notify,
}

impl<T: WorkerTransport> Default for IdleWorkers<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            queued_ids: Mutex::new(std::collections::HashSet::new()),
            notify: Notify::new(),
        }
    }
}

impl<T: WorkerTransport> IdleWorkers<T> {
    async fn push(&self, worker: Arc<Worker<T>>) {
        if self.queued_ids.lock().await.insert(worker.id) {
            self.queue.lock().await.push_back(worker);
            self.notify.notify_one();
        }
    }

    async fn pop(&self) -> Arc<Worker<T>> {
        loop {
            if let Some(worker) = self.queue.lock().await.pop_front() {
                self.queued_ids.lock().await.remove(&worker.id);
                return worker;
            }
            self.notify.notified().await;
        }
    }
}

/// Continuously matches idle workers to builds that need more of them.
pub struct WorkerAllocator<T: WorkerTransport> {
    idle_workers: IdleWorkers<T>,
    scheduler_pool: Arc<SchedulerPool<T>>,
}

impl<T: WorkerTransport + 'static> WorkerAllocator<T> {
    pub fn new(scheduler_pool: Arc<SchedulerPool<T>>) -> Self {
        Self {
            idle_workers: IdleWorkers::default(),
            scheduler_pool,
        }
    }

    /// Enqueues `worker` as idle and available for allocation. Marks the
    /// worker idle first; if that fails (executors still claimed, or the
    /// worker is shutting down) the worker is not enqueued.
    pub async fn add_idle_worker(&self, worker: Arc<Worker<T>>) {
        if worker.mark_as_idle().await.is_err() {
            return;
        }
        self.idle_workers.push(worker).await;
    }

    /// Spawns the allocation loop as a background task.
    pub fn spawn(self: Arc<Self>, cancel_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel_token).await })
    }

    async fn run(self: Arc<Self>, cancel_token: CancellationToken) {
        tracing::info!(target: TRACING_TARGET, "Starting worker allocation loop");
        loop {
            tokio::select! {
                biased;

                () = cancel_token.cancelled() => {
                    tracing::info!(target: TRACING_TARGET, "Worker allocation loop stopping");
                    break;
                }

                scheduler = self.scheduler_pool.next_prepared_build_scheduler() => {
                    self.allocate_workers_for(scheduler).await;
                }
            }
        }
    }

    async fn allocate_workers_for(&self, scheduler: Arc<BuildScheduler<T>>) {
        while scheduler.needs_more_workers().await {
            let claimed = self.idle_workers.pop().await;

            if claimed.is_shutdown() || !claimed.is_alive(false).await {
                tracing::debug!(
                    target: TRACING_TARGET,
                    worker_id = claimed.id,
                    "Discarding dead or shutting-down worker instead of allocating it"
                );
                continue;
            }

            // needs_more_workers is re-checked here to narrow (not
            // eliminate) the race where two builds could both decide they
            // need this worker between the check above and this one; the
            // worst case is one needless allocate_worker call.
            if !scheduler.needs_more_workers().await {
                self.add_idle_worker(claimed).await;
                continue;
            }

            if scheduler.allocate_worker(claimed.clone()).await {
                scheduler.begin_subjob_executions_on_worker(claimed).await;
            } else {
                self.add_idle_worker(claimed).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::subjob::Subjob;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct FakeTransport;

    impl WorkerTransport for FakeTransport {
        async fn setup(&self, _url: &str, _build_id: u32, _session_id: &str) -> crate::error::Result<bool> {
            Ok(true)
        }
        async fn teardown(&self, _url: &str, _build_id: u32) -> crate::error::Result<()> {
            Ok(())
        }
        async fn start_subjob(&self, _url: &str, _subjob: &Subjob, _job_command: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn is_alive(&self, _url: &str, _expected_session_id: &str) -> crate::error::Result<bool> {
            Ok(true)
        }
        async fn kill(&self, _url: &str) {}
    }

    #[tokio::test]
    async fn idle_workers_dedupe_repeated_pushes() {
        let idle: IdleWorkers<FakeTransport> = IdleWorkers::default();
        let transport = Arc::new(FakeTransport);
        let worker = Arc::new(Worker::new(1, "http://w1", 2, "s", transport));
        idle.push(worker.clone()).await;
        idle.push(worker.clone()).await;
        assert_eq!(idle.queue.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn allocator_assigns_idle_worker_to_waiting_build() {
        let pool: Arc<SchedulerPool<FakeTransport>> = Arc::new(SchedulerPool::new());
        let allocator = Arc::new(WorkerAllocator::new(pool.clone()));

        let is_canceled = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(BuildScheduler::new(
            1,
            vec![Subjob::new(1, 0, vec![Atom::new("export X=\"1\";")])],
            "make test",
            10,
            10,
            is_canceled,
        ));
        pool.add_scheduler(scheduler.clone()).await;

        let transport = Arc::new(FakeTransport);
        let worker = Arc::new(Worker::new(1, "http://w1", 1, "s", transport));
        allocator.idle_workers.push(worker.clone()).await;

        let next = pool.next_prepared_build_scheduler().await;
        allocator.allocate_workers_for(next).await;

        assert_eq!(scheduler.num_executors_allocated(), 1);
    }
}
