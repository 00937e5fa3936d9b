//! Composition root state shared by every axum handler on the worker side:
//! the local execution slot pool, the manager client, and the identity this
//! process presents to the manager (worker id, session id).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clusterrunner_core::executor::SubjobExecutor;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::client::ManagerClient;
use crate::config::ExecutorConfig;

/// Pool of local execution slots (`SubjobExecutor`s), handed out one per
/// concurrent subjob the way the original worker process dedicates one OS
/// process per executor index.
pub struct ExecutorSlots {
    tx: mpsc::Sender<u32>,
    rx: Mutex<mpsc::Receiver<u32>>,
}

impl ExecutorSlots {
    fn new(num_executors: u32) -> Self {
        let (tx, rx) = mpsc::channel(num_executors as usize);
        for id in 0..num_executors {
            tx.try_send(id).expect("channel sized to num_executors");
        }
        Self { tx, rx: Mutex::new(rx) }
    }

    /// Waits for a free slot index. Released slots are returned via
    /// [`ExecutorSlots::release`] once the caller is done with them.
    pub async fn acquire(&self) -> u32 {
        self.rx.lock().await.recv().await.expect("sender is never dropped while self is alive")
    }

    pub fn release(&self, id: u32) {
        let _ = self.tx.try_send(id);
    }
}

/// Shared application state, cheaply cloneable (every field is an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ExecutorConfig>,
    pub manager: Arc<ManagerClient>,
    pub slots: Arc<ExecutorSlots>,
    pub worker_id: u32,
    pub session_id: Arc<str>,
    /// Cancelled once, when a kill request or shutdown signal arrives.
    /// Races every in-flight atom command; never reset.
    pub kill_token: CancellationToken,
    current_build_id: Arc<RwLock<Option<u32>>>,
    current_project_directory: Arc<RwLock<Option<PathBuf>>>,
    shutting_down: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: ExecutorConfig, manager: ManagerClient, worker_id: u32, session_id: impl Into<Arc<str>>) -> Self {
        let slots = ExecutorSlots::new(config.num_executors);
        Self {
            config: Arc::new(config),
            manager: Arc::new(manager),
            slots: Arc::new(slots),
            worker_id,
            session_id: session_id.into(),
            kill_token: CancellationToken::new(),
            current_build_id: Arc::new(RwLock::new(None)),
            current_project_directory: Arc::new(RwLock::new(None)),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn executor_for_slot(&self, slot_id: u32) -> SubjobExecutor {
        SubjobExecutor::new(slot_id, self.config.artifact_dir.clone())
    }

    pub async fn set_current_build(&self, build_id: Option<u32>, project_directory: Option<PathBuf>) {
        *self.current_build_id.write().await = build_id;
        *self.current_project_directory.write().await = project_directory;
    }

    pub async fn current_build(&self) -> Option<u32> {
        *self.current_build_id.read().await
    }

    pub async fn current_project_directory(&self) -> Option<PathBuf> {
        self.current_project_directory.read().await.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}
