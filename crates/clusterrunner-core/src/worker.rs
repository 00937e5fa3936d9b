//! Worker: the manager-side proxy for a remote build executor process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use jiff::Timestamp;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::subjob::Subjob;

const TRACING_TARGET: &str = "clusterrunner_core::worker";

pub type WorkerId = u32;
pub type BuildId = u32;

/// The manager-side transport used to talk to a remote worker process.
/// Implemented concretely by `clusterrunner-manager` over HTTP; this trait
/// keeps the scheduling logic in this crate transport-agnostic.
#[allow(async_fn_in_trait)]
pub trait WorkerTransport: Send + Sync {
    async fn setup(
        &self,
        url: &str,
        build_id: BuildId,
        project_directory: &str,
        setup_build: Option<&str>,
        executor_start_index: u32,
    ) -> Result<bool>;
    async fn teardown(&self, url: &str, build_id: BuildId, teardown_build: Option<&str>) -> Result<()>;
    async fn start_subjob(&self, url: &str, subjob: &Subjob, job_command: &str, base_executor_index: u32) -> Result<()>;
    async fn is_alive(&self, url: &str, expected_session_id: &str) -> Result<bool>;
    async fn kill(&self, url: &str);
}

/// The manager-side proxy for a single remote worker process.
pub struct Worker<T: WorkerTransport> {
    pub id: WorkerId,
    pub url: String,
    pub num_executors: u32,
    pub session_id: String,
    transport: std::sync::Arc<T>,
    num_executors_in_use: AtomicU32,
    current_build_id: RwLock<Option<BuildId>>,
    /// `teardown_build` command for whatever build is currently set up on
    /// this worker, recorded on [`Self::setup`] and consumed by
    /// [`Self::teardown`].
    current_teardown_build: RwLock<Option<String>>,
    is_alive: AtomicBool,
    is_shutdown: AtomicBool,
    last_heartbeat_time: RwLock<Timestamp>,
}

impl<T: WorkerTransport> Worker<T> {
    pub fn new(id: WorkerId, url: impl Into<String>, num_executors: u32, session_id: impl Into<String>, transport: std::sync::Arc<T>) -> Self {
        Self {
            id,
            url: url.into(),
            num_executors,
            session_id: session_id.into(),
            transport,
            num_executors_in_use: AtomicU32::new(0),
            current_build_id: RwLock::new(None),
            current_teardown_build: RwLock::new(None),
            is_alive: AtomicBool::new(true),
            is_shutdown: AtomicBool::new(false),
            last_heartbeat_time: RwLock::new(Timestamp::now()),
        }
    }

    /// Records a heartbeat at the current time.
    pub async fn update_last_heartbeat_time(&self) {
        *self.last_heartbeat_time.write().await = Timestamp::now();
    }

    /// True if no heartbeat has been recorded within `timeout`.
    pub async fn heartbeat_is_stale(&self, timeout: Duration) -> bool {
        let last = *self.last_heartbeat_time.read().await;
        let elapsed = Timestamp::now().duration_since(last);
        elapsed.unsigned_abs() > timeout
    }

    pub fn num_executors_in_use(&self) -> u32 {
        self.num_executors_in_use.load(Ordering::SeqCst)
    }

    pub fn is_alive_cached(&self) -> bool {
        self.is_alive.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Claims one executor slot. Errors if every slot is already in use.
    pub fn claim_executor(&self) -> Result<()> {
        let previous = self.num_executors_in_use.fetch_add(1, Ordering::SeqCst);
        if previous >= self.num_executors {
            self.num_executors_in_use.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::internal(format!(
                "worker {} has no free executors (num_executors={})",
                self.id, self.num_executors
            )));
        }
        Ok(())
    }

    /// Frees one executor slot. Errors if no slot was in use.
    pub fn free_executor(&self) -> Result<u32> {
        let previous = self.num_executors_in_use.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        previous.map_err(|_| {
            Error::internal(format!("worker {} has no executors in use to free", self.id))
        })
    }

    /// Marks this worker idle. Errors if any executor is still claimed.
    /// If the worker is in shutdown mode, this instead kills it and
    /// returns an error so the caller does not re-enqueue it as idle.
    pub async fn mark_as_idle(&self) -> Result<()> {
        if self.num_executors_in_use() != 0 {
            return Err(Error::internal(format!(
                "cannot mark worker {} idle while executors are in use",
                self.id
            )));
        }
        if self.is_shutdown() {
            self.kill().await;
            return Err(Error::not_ready(format!(
                "worker {} is marked for shutdown",
                self.id
            )));
        }
        Ok(())
    }

    /// Sends the setup RPC for `build_id`. Sets `current_build_id` before
    /// issuing the request so that a concurrent reconnect sees the
    /// in-flight assignment. Marks the worker dead on any transport
    /// failure.
    pub async fn setup(
        &self,
        build_id: BuildId,
        project_directory: &str,
        setup_build: Option<&str>,
        executor_start_index: u32,
        teardown_build: Option<String>,
    ) -> bool {
        *self.current_build_id.write().await = Some(build_id);
        *self.current_teardown_build.write().await = teardown_build;
        match self
            .transport
            .setup(&self.url, build_id, project_directory, setup_build, executor_start_index)
            .await
        {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    worker_id = self.id,
                    error = %err,
                    "Worker setup failed, marking dead"
                );
                self.mark_dead();
                false
            }
        }
    }

    /// Tears down the current build on this worker. A no-op if the worker
    /// is already dead.
    pub async fn teardown(&self) {
        if !self.is_alive_cached() {
            return;
        }
        let build_id = *self.current_build_id.read().await;
        let teardown_build = self.current_teardown_build.read().await.clone();
        if let Some(build_id) = build_id
            && let Err(err) = self
                .transport
                .teardown(&self.url, build_id, teardown_build.as_deref())
                .await
        {
            tracing::warn!(target: TRACING_TARGET, worker_id = self.id, error = %err, "Worker teardown failed");
        }
        *self.current_build_id.write().await = None;
        *self.current_teardown_build.write().await = None;
    }

    /// Dispatches `subjob` to this worker. Preemptively rejects dead or
    /// shutdown-marked workers before attempting the RPC.
    pub async fn start_subjob(&self, subjob: &Subjob, job_command: &str, base_executor_index: u32) -> Result<()> {
        if !self.is_alive_cached() {
            return Err(Error::worker_communication(format!(
                "worker {} is dead",
                self.id
            )));
        }
        if self.is_shutdown() {
            return Err(Error::worker_communication(format!(
                "worker {} is marked for shutdown",
                self.id
            )));
        }
        self.transport
            .start_subjob(&self.url, subjob, job_command, base_executor_index)
            .await
            .map_err(|e| {
                Error::worker_communication(format!(
                    "failed to start subjob {} on worker {}",
                    subjob.subjob_id, self.id
                ))
                .with_source(Box::new(e))
            })
    }

    /// Checks liveness by probing the worker, marking it dead on any
    /// transport failure or session id mismatch (indicating a silent
    /// restart).
    pub async fn is_alive(&self, use_cached: bool) -> bool {
        if use_cached {
            return self.is_alive_cached();
        }
        match self.transport.is_alive(&self.url, &self.session_id).await {
            Ok(true) => true,
            Ok(false) | Err(_) => {
                self.mark_dead();
                false
            }
        }
    }

    /// Enters shutdown mode. If the worker is not currently assigned a
    /// build, kills it immediately rather than waiting for it to go idle.
    pub async fn set_shutdown_mode(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
        if self.current_build_id.read().await.is_none() {
            self.kill().await;
        }
    }

    /// Best-effort kill RPC, then unconditionally marks the worker dead.
    pub async fn kill(&self) {
        self.transport.kill(&self.url).await;
        self.mark_dead();
    }

    pub fn mark_dead(&self) {
        self.is_alive.store(false, Ordering::SeqCst);
    }
}

/// Registry of all known workers, indexed by both id and url.
pub struct WorkerRegistry<T: WorkerTransport> {
    by_id: RwLock<HashMap<WorkerId, std::sync::Arc<Worker<T>>>>,
    by_url: RwLock<HashMap<String, std::sync::Arc<Worker<T>>>>,
}

impl<T: WorkerTransport> Default for WorkerRegistry<T> {
    fn default() -> Self {
        Self {
            by_id: RwLock::new(HashMap::new()),
            by_url: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: WorkerTransport> WorkerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_worker(&self, worker: std::sync::Arc<Worker<T>>) {
        self.by_id.write().await.insert(worker.id, worker.clone());
        self.by_url.write().await.insert(worker.url.clone(), worker);
    }

    /// Removes a worker by id. Tolerates the worker already being absent.
    pub async fn remove_worker_by_id(&self, id: WorkerId) {
        if let Some(worker) = self.by_id.write().await.remove(&id) {
            self.by_url.write().await.remove(&worker.url);
        }
    }

    pub async fn remove_worker_by_url(&self, url: &str) {
        if let Some(worker) = self.by_url.write().await.remove(url) {
            self.by_id.write().await.remove(&worker.id);
        }
    }

    pub async fn get_by_id(&self, id: WorkerId) -> Result<std::sync::Arc<Worker<T>>> {
        self.by_id
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no worker with id {id}")))
    }

    pub async fn get_by_url(&self, url: &str) -> Result<std::sync::Arc<Worker<T>>> {
        self.by_url
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no worker at url {url}")))
    }

    pub async fn all_workers(&self) -> Vec<std::sync::Arc<Worker<T>>> {
        self.by_id.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeTransport {
        setup_calls: AtomicUsize,
        setup_result: std::sync::atomic::AtomicBool,
    }

    impl WorkerTransport for FakeTransport {
        async fn setup(
            &self,
            _url: &str,
            _build_id: BuildId,
            _project_directory: &str,
            _setup_build: Option<&str>,
            _executor_start_index: u32,
        ) -> Result<bool> {
            self.setup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.setup_result.load(Ordering::SeqCst))
        }
        async fn teardown(&self, _url: &str, _build_id: BuildId, _teardown_build: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn start_subjob(&self, _url: &str, _subjob: &Subjob, _job_command: &str, _base_executor_index: u32) -> Result<()> {
            Ok(())
        }
        async fn is_alive(&self, _url: &str, _expected_session_id: &str) -> Result<bool> {
            Ok(true)
        }
        async fn kill(&self, _url: &str) {}
    }

    fn worker() -> Worker<FakeTransport> {
        let transport = Arc::new(FakeTransport {
            setup_result: std::sync::atomic::AtomicBool::new(true),
            ..Default::default()
        });
        Worker::new(1, "http://worker-1", 4, "session-a", transport)
    }

    #[test]
    fn claim_executor_rejects_beyond_capacity() {
        let w = worker();
        for _ in 0..4 {
            w.claim_executor().unwrap();
        }
        assert!(w.claim_executor().is_err());
    }

    #[test]
    fn free_executor_rejects_when_none_in_use() {
        let w = worker();
        assert!(w.free_executor().is_err());
    }

    #[tokio::test]
    async fn mark_as_idle_rejects_while_executors_in_use() {
        let w = worker();
        w.claim_executor().unwrap();
        assert!(w.mark_as_idle().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_mode_kills_on_next_mark_idle() {
        let w = worker();
        w.set_shutdown_mode().await;
        assert!(w.mark_as_idle().await.is_err());
        assert!(!w.is_alive_cached());
    }

    #[tokio::test]
    async fn fresh_worker_heartbeat_is_not_stale() {
        let w = worker();
        assert!(!w.heartbeat_is_stale(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn heartbeat_goes_stale_after_the_timeout_elapses() {
        let w = worker();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(w.heartbeat_is_stale(Duration::from_millis(1)).await);
        w.update_last_heartbeat_time().await;
        assert!(!w.heartbeat_is_stale(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn registry_round_trips_by_id_and_url() {
        let registry: WorkerRegistry<FakeTransport> = WorkerRegistry::new();
        let w = Arc::new(worker());
        registry.add_worker(w.clone()).await;
        assert_eq!(registry.get_by_id(1).await.unwrap().url, "http://worker-1");
        assert_eq!(registry.get_by_url("http://worker-1").await.unwrap().id, 1);
        registry.remove_worker_by_id(1).await;
        assert!(registry.get_by_id(1).await.is_err());
        assert!(registry.get_by_url("http://worker-1").await.is_err());
    }

    #[tokio::test]
    async fn remove_worker_tolerates_missing_entry() {
        let registry: WorkerRegistry<FakeTransport> = WorkerRegistry::new();
        registry.remove_worker_by_id(42).await;
    }
}
