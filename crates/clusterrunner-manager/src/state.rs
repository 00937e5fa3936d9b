//! Composition root state shared by every axum handler: the domain
//! [`Manager`], the worker transport, and the bookkeeping the HTTP layer
//! needs that doesn't belong in `clusterrunner-core` (project directories
//! keyed by build id, worker id allocation).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use clusterrunner_core::allocator::WorkerAllocator;
use clusterrunner_core::manager::Manager;
use clusterrunner_core::request_handler::ProjectPreparationLocks;
use clusterrunner_core::worker::WorkerId;
use tokio::sync::RwLock;

use crate::config::ManagerConfig;
use crate::transport::ReqwestWorkerTransport;

/// Shared application state, cheaply cloneable (every field is an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager<ReqwestWorkerTransport>>,
    pub transport: Arc<ReqwestWorkerTransport>,
    pub allocator: Arc<WorkerAllocator<ReqwestWorkerTransport>>,
    pub config: Arc<ManagerConfig>,
    pub preparation_locks: Arc<ProjectPreparationLocks>,
    next_worker_id: Arc<AtomicU32>,
    /// Project checkout directory per build id, recorded when a build is
    /// requested and consulted when a subjob result is unpacked (atom
    /// timing keys are relative to the project directory, see
    /// [`clusterrunner_core::subjob::atom_key`]).
    project_directories: Arc<RwLock<HashMap<u32, PathBuf>>>,
}

impl AppState {
    pub fn new(config: ManagerConfig) -> Self {
        let transport = Arc::new(ReqwestWorkerTransport::new(
            config.hmac_secret.clone(),
            config.worker_rpc_timeout(),
        ));
        let manager = Arc::new(Manager::new(config.dispatch_pool_size));
        let allocator = Arc::new(WorkerAllocator::new(manager.scheduler_pool.clone()));
        Self {
            manager,
            transport,
            allocator,
            config: Arc::new(config),
            preparation_locks: Arc::new(ProjectPreparationLocks::new()),
            next_worker_id: Arc::new(AtomicU32::new(1)),
            project_directories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn allocate_worker_id(&self) -> WorkerId {
        self.next_worker_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn record_project_directory(&self, build_id: u32, directory: PathBuf) {
        self.project_directories.write().await.insert(build_id, directory);
    }

    pub async fn project_directory(&self, build_id: u32) -> Option<PathBuf> {
        self.project_directories.read().await.get(&build_id).cloned()
    }

    pub fn artifact_dir(&self, build_id: u32) -> PathBuf {
        clusterrunner_core::build::build_artifact_directory(&self.config.results_dir, build_id)
    }
}
