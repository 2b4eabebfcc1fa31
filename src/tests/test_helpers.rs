use crate::{
    agent::{RunnerClient, Worker},
    collab::{Collaborators, Outbox},
    commands::CommandRouter,
    config::Config,
    lifecycle::TaskLifecycle,
    logs::LogChannel,
    models::Provider,
    monitoring::Metrics,
    queue::{MemoryWorkQueue, WorkQueue},
    repocache::RepoCacheManager,
    store::{MemoryTaskStore, TaskStore},
    tokens::{AccessToken, TokenBroker},
    webhooks::{builtin_registry, dispatcher_router, DispatcherState},
    Result,
};
use async_trait::async_trait;
use axum::Router;
use std::sync::Arc;

/// Broker that always answers with a fixed token; worker tests don't
/// exercise the env-backed refresh path.
pub struct StaticBroker;

#[async_trait]
impl TokenBroker for StaticBroker {
    async fn get_token(&self, _: Provider, _: &str) -> Result<AccessToken> {
        Ok(AccessToken::new(
            "test-token".to_string(),
            chrono::Utc::now() + chrono::Duration::hours(1),
        ))
    }

    async fn invalidate(&self, _: Provider, _: &str) {}
}

/// A fully wired service graph against in-memory backends.
pub struct Harness {
    pub config: Config,
    pub lifecycle: Arc<TaskLifecycle>,
    pub commands: Arc<CommandRouter>,
    pub metrics: Arc<Metrics>,
    pub outbox: Arc<Outbox>,
    pub cache: Arc<RepoCacheManager>,
    pub broker: Arc<dyn TokenBroker>,
    _cache_root: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::for_tests())
    }

    pub fn with_config(config: Config) -> Self {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let queue: Arc<dyn WorkQueue> = Arc::new(MemoryWorkQueue::new(
            config.queue.high_water,
            config.queue.block_on_full,
            config.worker.max_attempts,
        ));
        let logs = Arc::new(LogChannel::new(
            config.logs.max_lines_per_task,
            config.logs.retention_seconds,
        ));
        let (collab, outbox) = Collaborators::logging();
        let metrics = Arc::new(Metrics::new());
        let lifecycle = Arc::new(TaskLifecycle::new(
            store,
            queue,
            logs,
            collab,
            metrics.clone(),
        ));
        let commands = Arc::new(CommandRouter::new(lifecycle.clone(), metrics.clone()));

        let cache_root = tempfile::tempdir().expect("tempdir");
        let mut cache_config = config.repo_cache.clone();
        cache_config.root = cache_root.path().to_string_lossy().to_string();
        let broker: Arc<dyn TokenBroker> = Arc::new(StaticBroker);
        let cache = Arc::new(RepoCacheManager::new_offline(
            cache_config,
            broker.clone(),
            metrics.clone(),
        ));

        Self {
            config,
            lifecycle,
            commands,
            metrics,
            outbox,
            cache,
            broker,
            _cache_root: cache_root,
        }
    }

    /// A worker whose "LLM" is a shell one-liner.
    pub fn worker(&self, script: &str) -> Worker {
        let runner = Arc::new(RunnerClient::stub("sh", &["-c", script, "runner"]));
        Worker::new(
            "test-worker".to_string(),
            self.lifecycle.clone(),
            runner,
            self.cache.clone(),
            self.broker.clone(),
            self.metrics.clone(),
            self.config.worker.clone(),
        )
    }

    /// The webhook dispatcher bound to this harness.
    pub fn webhook_router(&self) -> Router {
        dispatcher_router(
            builtin_registry(),
            DispatcherState {
                lifecycle: self.lifecycle.clone(),
                commands: self.commands.clone(),
                secrets: Arc::new(self.config.webhooks.clone()),
                metrics: self.metrics.clone(),
            },
        )
    }
}
