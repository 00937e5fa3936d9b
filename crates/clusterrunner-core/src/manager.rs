//! Manager: the top-level facade composing the registry, scheduler pool,
//! allocator, and request handler into the system an operator talks to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::build::Build;
use crate::error::{Error, Result};
use crate::scheduler::{BuildScheduler, SchedulerPool};
use crate::worker::{Worker, WorkerId, WorkerRegistry, WorkerTransport};

const TRACING_TARGET: &str = "clusterrunner_core::manager";

/// Number of concurrent dispatch-pool tasks handling subjob-result
/// ingestion, decoupling inbound result ingestion from outbound teardown
/// RPC latency.
pub const DEFAULT_DISPATCH_POOL_SIZE: usize = 32;

/// Default interval between heartbeat sweeps and the staleness threshold
/// applied to each worker's last heartbeat.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// A state update reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStateUpdate {
    Idle,
    Disconnected,
    Shutdown,
    SetupCompleted,
    SetupFailed,
}

pub struct Manager<T: WorkerTransport> {
    pub registry: Arc<WorkerRegistry<T>>,
    pub scheduler_pool: Arc<SchedulerPool<T>>,
    builds: RwLock<HashMap<u32, Arc<Mutex<Build>>>>,
    next_build_id: AtomicU32,
    dispatch_semaphore: Arc<Semaphore>,
}

impl<T: WorkerTransport + 'static> Manager<T> {
    pub fn new(dispatch_pool_size: usize) -> Self {
        Self {
            registry: Arc::new(WorkerRegistry::new()),
            scheduler_pool: Arc::new(SchedulerPool::new()),
            builds: RwLock::new(HashMap::new()),
            next_build_id: AtomicU32::new(1),
            dispatch_semaphore: Arc::new(Semaphore::new(dispatch_pool_size)),
        }
    }

    pub fn with_default_dispatch_pool() -> Self {
        Self::new(DEFAULT_DISPATCH_POOL_SIZE)
    }

    pub async fn get_build(&self, build_id: u32) -> Result<Arc<Mutex<Build>>> {
        self.builds
            .read()
            .await
            .get(&build_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no build with id {build_id}")))
    }

    /// Registers a newly queued build and returns its freshly allocated id.
    pub async fn register_build(&self, queued_at: jiff::Timestamp) -> u32 {
        let id = self.next_build_id.fetch_add(1, Ordering::SeqCst);
        let build = Arc::new(Mutex::new(Build::new(id, queued_at)));
        self.builds.write().await.insert(id, build);
        id
    }

    /// Handles a new-build request. Validating the requested project type
    /// against the set of project types the process knows about is the HTTP
    /// layer's job (it owns that registry); by the time a request reaches
    /// here it is assumed already-validated, so this is just `register_build`
    /// under the name the facade's operation table uses.
    pub async fn handle_request_for_new_build(&self, queued_at: jiff::Timestamp) -> u32 {
        self.register_build(queued_at).await
    }

    /// Handles an update-build request. The only supported update is
    /// canceling the build.
    pub async fn handle_request_to_update_build(&self, build_id: u32) -> Result<()> {
        let build = self.get_build(build_id).await?;
        build.lock().await.cancel();
        if let Some(scheduler) = self.scheduler_pool.get(build_id).await {
            scheduler.cancel();
        }
        Ok(())
    }

    /// Connects (or reconnects) a worker at `url`. If a worker is already
    /// registered at this url, its old registration is torn down
    /// unconditionally before the new one replaces it — reconnects under
    /// load must never leave two live registrations for the same url.
    pub async fn connect_worker(&self, id: WorkerId, url: String, num_executors: u32, session_id: String, transport: Arc<T>) -> Arc<Worker<T>> {
        if let Ok(existing) = self.registry.get_by_url(&url).await {
            tracing::warn!(
                target: TRACING_TARGET,
                url = %url,
                old_worker_id = existing.id,
                "Worker reconnected at an already-registered url, replacing old registration"
            );
            existing.mark_dead();
            self.registry.remove_worker_by_url(&url).await;
        }

        let worker = Arc::new(Worker::new(id, url, num_executors, session_id, transport));
        self.registry.add_worker(worker.clone()).await;
        worker
    }

    /// Dispatches a worker state update through a match on `update` rather
    /// than a chain of conditionals.
    pub async fn handle_worker_state_update(
        &self,
        worker_id: WorkerId,
        update: WorkerStateUpdate,
        allocator_add_idle: impl AsyncFnOnce(Arc<Worker<T>>),
    ) -> Result<()> {
        let worker = self.registry.get_by_id(worker_id).await?;
        match update {
            WorkerStateUpdate::Disconnected => {
                worker.mark_dead();
                self.registry.remove_worker_by_id(worker_id).await;
            }
            WorkerStateUpdate::Shutdown => {
                worker.set_shutdown_mode().await;
            }
            WorkerStateUpdate::Idle => {
                allocator_add_idle(worker).await;
            }
            WorkerStateUpdate::SetupCompleted => {}
            WorkerStateUpdate::SetupFailed => {
                self.handle_setup_failure(worker).await;
            }
        }
        Ok(())
    }

    async fn handle_setup_failure(&self, worker: Arc<Worker<T>>) {
        tracing::warn!(
            target: TRACING_TARGET,
            worker_id = worker.id,
            "Worker reported a setup failure"
        );
        worker.teardown().await;
    }

    /// Handles a subjob result reported by a worker: records it on the
    /// build, finalizing the build if that was its last outstanding
    /// subjob. Regardless of whether recording the result succeeds,
    /// dispatches the next subjob or frees the worker's executor through
    /// the bounded dispatch pool, so a slow teardown RPC never blocks
    /// ingestion of further results.
    pub async fn handle_result_reported_from_worker(
        &self,
        build: Arc<Mutex<Build>>,
        subjob_id: u32,
        atom_timings: HashMap<String, f64>,
        scheduler: Arc<BuildScheduler<T>>,
        worker: Arc<Worker<T>>,
    ) -> Result<()> {
        let completion = build.lock().await.complete_subjob(subjob_id, atom_timings);

        let permit = self.dispatch_semaphore.clone().acquire_owned().await;
        tokio::spawn(async move {
            let _permit = permit;
            scheduler.execute_next_subjob_or_free_executor(worker).await;
        });

        match completion {
            Ok(true) => build.lock().await.finalize(),
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Records that `worker_id` has sent a heartbeat just now.
    pub async fn update_worker_last_heartbeat_time(&self, worker_id: WorkerId) -> Result<()> {
        let worker = self.registry.get_by_id(worker_id).await?;
        worker.update_last_heartbeat_time().await;
        Ok(())
    }

    /// One pass of the heartbeat sweeper: marks dead (and deregisters) every
    /// alive worker whose last heartbeat is older than `timeout`. Intended
    /// to be called on a fixed interval (see
    /// [`DEFAULT_HEARTBEAT_TIMEOUT`]) by a long-lived background task.
    pub async fn sweep_unresponsive_workers(&self, timeout: Duration) {
        for worker in self.registry.all_workers().await {
            if worker.is_alive_cached() && worker.heartbeat_is_stale(timeout).await {
                tracing::warn!(
                    target: TRACING_TARGET,
                    worker_id = worker.id,
                    "Worker heartbeat timed out, marking dead"
                );
                worker.mark_dead();
                self.registry.remove_worker_by_id(worker.id).await;
            }
        }
    }
}
