//! Process wiring: storage, queue, reconciler, worker pool and service.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::database::Database;
use crate::metrics::MetricsAggregator;
use crate::queue::{JobProcessor, JobQueue, LocalQueue};
use crate::reconciler::ExecutionReconciler;
use crate::scheduler::{CommandExecutor, ExecutionWorker, ScheduleRegistrar, ScheduleSynchronizer};
use crate::service::TaskService;

/// Every long-lived component of a running scheduler.
#[derive(Debug)]
pub struct Runtime {
    pub db: Database,
    pub queue: Arc<LocalQueue>,
    pub service: TaskService,
    reconciler: Arc<ExecutionReconciler>,
    worker: Arc<ExecutionWorker>,
    concurrency: usize,
    poll_interval: Duration,
}

/// Handles of the background loops started by [`Runtime::start`].
#[derive(Debug)]
pub struct RuntimeHandles {
    reconciler: JoinHandle<()>,
    worker: JoinHandle<()>,
    reconciler_shutdown: CancellationToken,
}

impl RuntimeHandles {
    /// Wait for the worker pool to finish its in-flight jobs, then stop the
    /// reconciler once it has taken the remaining events.
    pub async fn join(self) {
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "Queue worker loop panicked");
        }
        self.reconciler_shutdown.cancel();
        if let Err(e) = self.reconciler.await {
            tracing::error!(error = %e, "Reconciler loop panicked");
        }
    }
}

impl Runtime {
    /// Open storage from `config` and wire the components.
    pub async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let db = Database::open(&config.database.path).await?;
        Ok(Self::with_database(config, db))
    }

    /// Wire the components around an already opened database.
    pub fn with_database(config: &AppConfig, db: Database) -> Self {
        let queue = Arc::new(LocalQueue::new(
            config.queue.name.clone(),
            config.queue.event_capacity,
        ));
        let broker: Arc<dyn JobQueue> = Arc::<LocalQueue>::clone(&queue);

        let registrar = ScheduleRegistrar::new(Arc::clone(&broker), config.queue.attempts);
        let metrics = MetricsAggregator::new(db.clone());
        let synchronizer = ScheduleSynchronizer::new(registrar.clone(), db.clone(), metrics.clone());
        let reconciler = ExecutionReconciler::new(broker, db.clone(), registrar, metrics.clone());
        let service = TaskService::new(db.clone(), synchronizer, metrics);
        let worker = ExecutionWorker::new(CommandExecutor::new(&config.executor));

        Self {
            db,
            queue,
            service,
            reconciler: Arc::new(reconciler),
            worker: Arc::new(worker),
            concurrency: config.queue.concurrency,
            poll_interval: config.queue.poll_interval(),
        }
    }

    /// Spawn the reconciler and the worker pool. The worker stops when
    /// `shutdown` is cancelled; the reconciler stops in [`RuntimeHandles::join`].
    pub fn start(&self, shutdown: &CancellationToken) -> RuntimeHandles {
        // Subscribe before the worker runs so no early event is missed.
        let events = self.queue.subscribe();
        let reconciler_shutdown = CancellationToken::new();
        let reconciler = tokio::spawn(
            Arc::clone(&self.reconciler).run(events, reconciler_shutdown.clone()),
        );
        let worker = tokio::spawn(Arc::clone(&self.queue).run(
            Arc::clone(&self.worker) as Arc<dyn JobProcessor>,
            self.concurrency,
            self.poll_interval,
            shutdown.child_token(),
        ));

        RuntimeHandles {
            reconciler,
            worker,
            reconciler_shutdown,
        }
    }
}
