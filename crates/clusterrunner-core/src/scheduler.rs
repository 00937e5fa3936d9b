//! BuildScheduler / SchedulerPool: allocates workers to a build's subjobs
//! and drives subjob dispatch.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::{Mutex, Notify};

use crate::error::Result;
use crate::subjob::Subjob;
use crate::worker::{Worker, WorkerId, WorkerTransport};

const TRACING_TARGET: &str = "clusterrunner_core::scheduler";

/// Per-build scheduling state: how many executors are allocated, which
/// workers are currently assigned, and the queue of subjobs still waiting
/// to run.
pub struct BuildScheduler<T: WorkerTransport> {
    pub build_id: u32,
    max_executors: u32,
    max_executors_per_worker: u32,
    job_command: String,
    project_directory: String,
    setup_build: Option<String>,
    teardown_build: Option<String>,
    num_executors_allocated: AtomicU32,
    build_started: AtomicBool,
    is_canceled: Arc<AtomicBool>,
    workers_allocated: Mutex<Vec<Arc<Worker<T>>>>,
    /// Each allocated worker's `executor_start_index` — the pre-increment
    /// `num_executors_allocated` value at the moment it was granted
    /// executors — so dispatch can compute a build-wide unique
    /// `BUILD_EXECUTOR_INDEX` on the worker side.
    worker_base_index: Mutex<HashMap<WorkerId, u32>>,
    unstarted_subjobs: Mutex<VecDeque<Subjob>>,
    total_subjob_count: usize,
    /// Held across the `worker.start_subjob` RPC round-trip so that two
    /// executors on the same worker can never race to pop the same
    /// subjob off the queue and dispatch it twice.
    subjob_assignment_lock: Mutex<()>,
}

impl<T: WorkerTransport> BuildScheduler<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        build_id: u32,
        subjobs: Vec<Subjob>,
        job_command: impl Into<String>,
        project_directory: impl Into<String>,
        setup_build: Option<String>,
        teardown_build: Option<String>,
        max_executors: u32,
        max_executors_per_worker: u32,
        is_canceled: Arc<AtomicBool>,
    ) -> Self {
        let total_subjob_count = subjobs.len();
        Self {
            build_id,
            max_executors,
            max_executors_per_worker,
            job_command: job_command.into(),
            project_directory: project_directory.into(),
            setup_build,
            teardown_build,
            num_executors_allocated: AtomicU32::new(0),
            build_started: AtomicBool::new(false),
            is_canceled,
            workers_allocated: Mutex::new(Vec::new()),
            worker_base_index: Mutex::new(HashMap::new()),
            unstarted_subjobs: Mutex::new(subjobs.into_iter().collect()),
            total_subjob_count,
            subjob_assignment_lock: Mutex::new(()),
        }
    }

    pub fn num_executors_allocated(&self) -> u32 {
        self.num_executors_allocated.load(Ordering::SeqCst)
    }

    /// Latches cancellation: subsequent allocation attempts are refused and
    /// workers already mid-dispatch are freed once their current subjob
    /// completes. Shares the same `Arc<AtomicBool>` passed to
    /// construction, so cloning it into a [`crate::build::Build`]'s own
    /// cancel path keeps both in sync.
    pub fn cancel(&self) {
        self.is_canceled.store(true, Ordering::SeqCst);
    }

    /// Whether this build could use another worker right now.
    pub async fn needs_more_workers(&self) -> bool {
        if self.is_canceled.load(Ordering::SeqCst) {
            return false;
        }
        if self.num_executors_allocated() >= self.max_executors {
            return false;
        }
        if self.unstarted_subjobs.lock().await.is_empty() {
            return false;
        }
        if self.num_executors_allocated() as usize >= self.total_subjob_count {
            return false;
        }
        true
    }

    /// Allocates `worker` to this build, claiming up to
    /// `max_executors_per_worker` of its executors. The executor count is
    /// incremented *before* the setup RPC is issued, so a worker that
    /// repeatedly fails setup does not get re-offered unbounded capacity
    /// on this build.
    pub async fn allocate_worker(&self, worker: Arc<Worker<T>>) -> bool {
        self.build_started.store(true, Ordering::SeqCst);

        let granted = worker.num_executors.min(self.max_executors_per_worker);
        let start_index = self
            .num_executors_allocated
            .fetch_add(granted, Ordering::SeqCst);
        self.worker_base_index
            .lock()
            .await
            .insert(worker.id, start_index);
        self.workers_allocated.lock().await.push(worker.clone());

        let accepted = worker
            .setup(
                self.build_id,
                &self.project_directory,
                self.setup_build.as_deref(),
                start_index,
                self.teardown_build.clone(),
            )
            .await;
        tracing::info!(
            target: TRACING_TARGET,
            build_id = self.build_id,
            worker_id = worker.id,
            granted_executors = granted,
            accepted,
            "Allocated worker to build"
        );
        accepted
    }

    /// Claims executors on `worker` up to its capacity and begins
    /// dispatching subjobs on each.
    pub async fn begin_subjob_executions_on_worker(&self, worker: Arc<Worker<T>>) {
        for i in 0..worker.num_executors {
            if self.num_executors_in_use_across_build(&worker).await >= self.max_executors
                || i >= self.max_executors_per_worker
            {
                break;
            }
            if worker.claim_executor().is_err() {
                break;
            }
            self.execute_next_subjob_or_free_executor(worker.clone())
                .await;
        }
    }

    async fn num_executors_in_use_across_build(&self, _worker: &Arc<Worker<T>>) -> u32 {
        // Aggregate executors in use across every worker allocated to this
        // build.
        let mut total = 0;
        for w in self.workers_allocated.lock().await.iter() {
            total += w.num_executors_in_use();
        }
        total
    }

    /// Pops the next unstarted subjob (if any) and dispatches it to
    /// `worker`; otherwise frees the claimed executor. Holds
    /// `subjob_assignment_lock` across the dispatch RPC.
    pub async fn execute_next_subjob_or_free_executor(&self, worker: Arc<Worker<T>>) {
        if self.is_canceled.load(Ordering::SeqCst) {
            let _ = worker.free_executor();
            self.free_worker_if_idle(&worker).await;
            return;
        }

        let _guard = self.subjob_assignment_lock.lock().await;
        let subjob = self.unstarted_subjobs.lock().await.pop_front();

        let Some(subjob) = subjob else {
            drop(_guard);
            let _ = worker.free_executor();
            self.free_worker_if_idle(&worker).await;
            return;
        };

        let base_executor_index = self
            .worker_base_index
            .lock()
            .await
            .get(&worker.id)
            .copied()
            .unwrap_or(0);
        match worker
            .start_subjob(&subjob, &self.job_command, base_executor_index)
            .await
        {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    build_id = self.build_id,
                    worker_id = worker.id,
                    error = %err,
                    "Failed to dispatch subjob, requeueing"
                );
                self.unstarted_subjobs.lock().await.push_front(subjob);
                drop(_guard);
                let _ = worker.free_executor();
                self.free_worker_if_idle(&worker).await;
            }
        }
    }

    /// Frees `worker`'s allocation to this build entirely if it has no
    /// executors left in use, tearing it down. If this empties the
    /// allocated-workers list and the build still needs more workers, the
    /// caller is responsible for re-enqueueing via [`SchedulerPool`].
    async fn free_worker_if_idle(&self, worker: &Arc<Worker<T>>) {
        if worker.num_executors_in_use() != 0 {
            return;
        }
        let mut allocated = self.workers_allocated.lock().await;
        allocated.retain(|w| w.id != worker.id);
        let now_empty = allocated.is_empty();
        drop(allocated);
        self.worker_base_index.lock().await.remove(&worker.id);
        if now_empty {
            worker.teardown().await;
        }
    }

    pub async fn is_fully_unallocated(&self) -> bool {
        self.workers_allocated.lock().await.is_empty()
    }
}

/// A pool of one [`BuildScheduler`] per in-flight build, plus a queue of
/// builds waiting for more workers.
pub struct SchedulerPool<T: WorkerTransport> {
    schedulers: Mutex<std::collections::HashMap<u32, Arc<BuildScheduler<T>>>>,
    waiting_for_workers: Mutex<VecDeque<Arc<BuildScheduler<T>>>>,
    notify: Notify,
}

impl<T: WorkerTransport> Default for SchedulerPool<T> {
    fn default() -> Self {
        Self {
            schedulers: Mutex::new(std::collections::HashMap::new()),
            waiting_for_workers: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl<T: WorkerTransport> SchedulerPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_scheduler(&self, scheduler: Arc<BuildScheduler<T>>) {
        self.schedulers
            .lock()
            .await
            .insert(scheduler.build_id, scheduler.clone());
        self.add_build_waiting_for_workers(scheduler).await;
    }

    pub async fn get(&self, build_id: u32) -> Option<Arc<BuildScheduler<T>>> {
        self.schedulers.lock().await.get(&build_id).cloned()
    }

    /// Enqueues `scheduler` to be offered workers and wakes anyone blocked
    /// in [`Self::next_prepared_build_scheduler`].
    pub async fn add_build_waiting_for_workers(&self, scheduler: Arc<BuildScheduler<T>>) {
        self.waiting_for_workers.lock().await.push_back(scheduler);
        self.notify.notify_one();
    }

    /// Blocks until a build scheduler that may still need workers is
    /// available, then returns it.
    pub async fn next_prepared_build_scheduler(&self) -> Arc<BuildScheduler<T>> {
        loop {
            if let Some(scheduler) = self.waiting_for_workers.lock().await.pop_front() {
                return scheduler;
            }
            self.notify.notified().await;
        }
    }

    pub async fn remove_scheduler(&self, build_id: u32) {
        self.schedulers.lock().await.remove(&build_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeTransport {
        start_subjob_calls: AtomicUsize,
        start_subjob_should_fail: AtomicBool,
    }

    impl WorkerTransport for FakeTransport {
        async fn setup(
            &self,
            _url: &str,
            _build_id: u32,
            _project_directory: &str,
            _setup_build: Option<&str>,
            _executor_start_index: u32,
        ) -> Result<bool> {
            Ok(true)
        }
        async fn teardown(&self, _url: &str, _build_id: u32, _teardown_build: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn start_subjob(
            &self,
            _url: &str,
            _subjob: &Subjob,
            _job_command: &str,
            _base_executor_index: u32,
        ) -> Result<()> {
            self.start_subjob_calls.fetch_add(1, Ordering::SeqCst);
            if self.start_subjob_should_fail.load(Ordering::SeqCst) {
                Err(crate::error::Error::worker_communication("boom"))
            } else {
                Ok(())
            }
        }
        async fn is_alive(&self, _url: &str, _expected_session_id: &str) -> Result<bool> {
            Ok(true)
        }
        async fn kill(&self, _url: &str) {}
    }

    fn subjob(id: u32) -> Subjob {
        Subjob::new(1, id, vec![Atom::new("export X=\"1\";")])
    }

    #[tokio::test]
    async fn needs_more_workers_false_once_subjob_queue_drained() {
        let is_canceled = Arc::new(AtomicBool::new(false));
        let scheduler = BuildScheduler::<FakeTransport>::new(
            1,
            vec![subjob(0)],
            "make test",
            "/project",
            None,
            None,
            10,
            10,
            is_canceled,
        );
        assert!(scheduler.needs_more_workers().await);
        scheduler.unstarted_subjobs.lock().await.clear();
        assert!(!scheduler.needs_more_workers().await);
    }

    #[tokio::test]
    async fn needs_more_workers_false_when_canceled() {
        let is_canceled = Arc::new(AtomicBool::new(true));
        let scheduler = BuildScheduler::<FakeTransport>::new(
            1,
            vec![subjob(0)],
            "make test",
            "/project",
            None,
            None,
            10,
            10,
            is_canceled,
        );
        assert!(!scheduler.needs_more_workers().await);
    }

    #[tokio::test]
    async fn execute_next_subjob_requeues_on_dispatch_failure() {
        let is_canceled = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(BuildScheduler::<FakeTransport>::new(
            1,
            vec![subjob(0)],
            "make test",
            "/project",
            None,
            None,
            10,
            10,
            is_canceled,
        ));
        let transport = Arc::new(FakeTransport {
            start_subjob_should_fail: AtomicBool::new(true),
            ..Default::default()
        });
        let worker = Arc::new(Worker::new(1, "http://w1", 1, "session", transport));
        worker.claim_executor().unwrap();

        scheduler
            .execute_next_subjob_or_free_executor(worker.clone())
            .await;

        assert_eq!(scheduler.unstarted_subjobs.lock().await.len(), 1);
        assert_eq!(worker.num_executors_in_use(), 0);
    }
}
