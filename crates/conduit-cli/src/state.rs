//! Application state wiring storage, executor and services together.
//!
//! Core services are generic over the repository traits; AppState pins them
//! to the SQLite implementations from conduit-infra.

use std::path::PathBuf;
use std::time::Duration;
use std::sync::Arc;

use conduit_core::event::EventBus;
use conduit_core::router::{
    BoxMessageHandler, ConsensusMessageHandler, HandlerRegistry, WorkflowMessageHandler,
};
use conduit_core::workflow::{DagExecutor, WorkflowRegistry, WorkflowService};
use conduit_core::consensus::CONSENSUS_WORKFLOW_TYPE;
use conduit_infra::config::{load_global_config, resolve_data_dir, resolve_database_url};
use conduit_infra::sqlite::pool::DatabasePool;
use conduit_infra::sqlite::queue::SqliteQueueRepository;
use conduit_infra::sqlite::workflow::SqliteWorkflowRepository;
use conduit_types::config::GlobalConfig;
use conduit_types::envelope::MessageKind;

use crate::catalog;

pub type ConcreteQueue = Arc<SqliteQueueRepository>;
pub type ConcreteRepo = Arc<SqliteWorkflowRepository>;
pub type ConcreteExecutor = DagExecutor<ConcreteRepo>;
pub type ConcreteService = WorkflowService<ConcreteQueue, ConcreteRepo>;

/// Shared application state used by every command.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub database_url: String,
    pub config: GlobalConfig,
    pub db_pool: DatabasePool,
    pub queue: ConcreteQueue,
    pub repo: ConcreteRepo,
    pub registry: WorkflowRegistry,
    pub executor: Arc<ConcreteExecutor>,
    pub service: Arc<ConcreteService>,
}

impl AppState {
    /// Resolve configuration, open the database and wire services.
    pub async fn init(
        data_dir: Option<PathBuf>,
        database_url: Option<&str>,
    ) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_global_config(&data_dir).await;
        let database_url = resolve_database_url(&config, &data_dir, database_url);
        let db_pool = DatabasePool::new(&database_url).await?;

        let queue = Arc::new(SqliteQueueRepository::new(db_pool.clone()));
        let repo = Arc::new(SqliteWorkflowRepository::new(db_pool.clone()));

        let registry = WorkflowRegistry::new();
        catalog::register_builtin(&registry, &config.executor)?;

        let executor = Arc::new(
            DagExecutor::new(
                Arc::clone(&repo),
                EventBus::new(config.executor.event_capacity.max(1)),
            )
            .with_run_lease(Duration::from_secs(config.executor.run_lease_secs.max(1))),
        );
        let service = Arc::new(WorkflowService::new(
            Arc::clone(&queue),
            Arc::clone(&repo),
            registry.clone(),
        ));

        Ok(Self {
            data_dir,
            database_url,
            config,
            db_pool,
            queue,
            repo,
            registry,
            executor,
            service,
        })
    }

    /// Handlers for every envelope kind the worker understands.
    pub fn handlers(&self) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::with_ping().register(
            MessageKind::Workflow,
            BoxMessageHandler::new(WorkflowMessageHandler::new(
                Arc::clone(&self.executor),
                self.registry.clone(),
            )),
        );
        if let Some(consensus) = self.registry.get(CONSENSUS_WORKFLOW_TYPE) {
            handlers = handlers.register(
                MessageKind::ConsensusReview,
                BoxMessageHandler::new(ConsensusMessageHandler::new(
                    Arc::clone(&self.executor),
                    consensus,
                )),
            );
        }
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::router::MultiQueueConsumer;
    use conduit_types::workflow::WorkflowStatus;
    use serde_json::json;

    async fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::init(Some(dir.path().to_path_buf()), None)
            .await
            .unwrap();
        std::mem::forget(dir);
        state
    }

    #[tokio::test]
    async fn init_registers_builtins_and_handlers() {
        let state = test_state().await;
        assert!(state.database_url.ends_with("conduit.db?mode=rwc"));
        assert!(state.registry.contains(catalog::ECHO_WORKFLOW_TYPE));
        assert!(state.registry.contains(CONSENSUS_WORKFLOW_TYPE));

        let handlers = state.handlers();
        assert!(handlers.get(MessageKind::Workflow).is_some());
        assert!(handlers.get(MessageKind::ConsensusReview).is_some());
        assert!(handlers.get(MessageKind::Ping).is_some());
    }

    #[tokio::test]
    async fn submitted_workflow_completes_after_one_poll() {
        let state = test_state().await;
        let id = state
            .service
            .submit_workflow(catalog::DIAMOND_WORKFLOW_TYPE, json!({"n": 1}))
            .await
            .unwrap();

        let consumer = Arc::new(MultiQueueConsumer::new(
            Arc::clone(&state.queue),
            state.handlers(),
            state.config.consumer.clone(),
        ));
        consumer.ensure_queues().await.unwrap();
        assert_eq!(consumer.poll_once().await.unwrap(), 1);

        let status = state.service.get_status(id).await.unwrap();
        assert_eq!(status.status, WorkflowStatus::Completed);

        let results = state.service.get_results(id).await.unwrap();
        assert_eq!(results["join"]["step"], "join");
        assert!(results["join"]["upstream"]["left"].is_object());
        assert!(results["join"]["upstream"]["right"].is_object());
    }
}
