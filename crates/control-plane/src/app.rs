//! Composition root: builds the core subsystems by reference (no singletons) and
//! wires the cron scheduler's invoker capability to the worker supervisor's `invoke`.

use crate::config::ControlPlaneConfig;
use async_trait::async_trait;
use core_content_store::{ContentStoreClient, MemoryBackend};
use core_cron::{CronScheduler, FunctionInvoker, InvokeError, InvokeOutcome};
use core_database::{BackupWorker, LifecycleController};
use core_pool::PoolManager;
use core_runtime::{HttpEvent, PortAllocator, WorkerSupervisor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;

/// Bridges the cron scheduler's `invoke(functionId, event)` capability onto the
/// worker supervisor's HTTP invocation path.
struct WorkerInvoker {
    supervisor: Arc<WorkerSupervisor>,
}

#[async_trait]
impl FunctionInvoker for WorkerInvoker {
    async fn invoke(
        &self,
        function_id: core_common::ids::FunctionId,
        event: serde_json::Value,
    ) -> Result<InvokeOutcome, InvokeError> {
        let body = serde_json::to_vec(&event).unwrap_or_default();
        let http_event = HttpEvent {
            method: "POST".to_string(),
            path: "/".to_string(),
            query: None,
            headers: HashMap::new(),
            body,
        };
        let response = self
            .supervisor
            .invoke_http(function_id, http_event)
            .await
            .map_err(|e| InvokeError::Failed(e.to_string()))?;
        Ok(InvokeOutcome {
            output: String::from_utf8_lossy(&response.body).to_string(),
            exit_code: 0,
        })
    }
}

/// Owns every subsystem and the background tasks that drive them. Dropping it aborts
/// the background `JoinSet`.
pub struct App {
    pub content_store: Arc<ContentStoreClient>,
    pub ports: Arc<PortAllocator>,
    pub worker_supervisor: Arc<WorkerSupervisor>,
    pub cron_scheduler: Arc<CronScheduler>,
    pub pool_manager: PoolManager,
    pub lifecycle: LifecycleController,
    config: ControlPlaneConfig,
    background: JoinSet<()>,
}

impl App {
    pub fn new(config: ControlPlaneConfig) -> Self {
        let content_store = Arc::new(ContentStoreClient::new(Arc::new(MemoryBackend::new())));
        let ports = Arc::new(PortAllocator::new(config.ports.clone().into()));

        let worker_supervisor = Arc::new(WorkerSupervisor::new(
            config.worker.clone().into(),
            content_store.clone(),
            ports.clone(),
        ));

        let cron_scheduler = Arc::new(CronScheduler::new(Arc::new(WorkerInvoker {
            supervisor: worker_supervisor.clone(),
        })));

        let pool_manager = PoolManager::new();
        let backup_worker = BackupWorker::new((*content_store).clone());
        let lifecycle = LifecycleController::new(pool_manager.clone(), backup_worker);

        Self {
            content_store,
            ports,
            worker_supervisor,
            cron_scheduler,
            pool_manager,
            lifecycle,
            config,
            background: JoinSet::new(),
        }
    }

    /// Starts the cron ticker and the worker reaper as background tasks on an owned
    /// `JoinSet`.
    pub fn start_background_tasks(&mut self) {
        let scheduler = self.cron_scheduler.clone();
        let tick_interval = self.config.cron.tick_interval;
        self.background.spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;
                scheduler.tick(chrono::Utc::now());
            }
        });

        let supervisor = self.worker_supervisor.clone();
        let reap_interval = self.config.reaper.interval;
        self.background.spawn(async move {
            let mut interval = tokio::time::interval(reap_interval);
            loop {
                interval.tick().await;
                supervisor.reap().await;
            }
        });

        info!("background tasks started: cron ticker, worker reaper");
    }

    /// Waits for every background task to finish (they run until cancelled, so in
    /// practice this is used on shutdown after the `JoinSet` is aborted).
    pub async fn join_background(&mut self) {
        while self.background.join_next().await.is_some() {}
    }

    pub fn shutdown(&mut self) {
        self.background.abort_all();
    }
}
