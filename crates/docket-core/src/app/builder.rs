//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - 設定の整合性（`OrchestratorConfig::validate`）
//! - 必須コンポーネント（TaskStore / WorkQueue）
//! - 期待する task kind すべてに、対応するプロバイダが有効になっていること
//!
//! 不足があれば build() が BuildError を返し、ワーカーは 1 つも起動しない。

use std::sync::Arc;

use tracing::info;

use crate::app::cancel::TaskCanceller;
use crate::app::gateway::ProviderGateway;
use crate::app::producer::TaskProducer;
use crate::app::reaper_loop::{ReaperHandle, ReaperLoop};
use crate::app::relay::{ProgressRelay, RelayHandle};
use crate::app::status::{StatusQuery, TaskView};
use crate::app::worker_loop::{Worker, WorkerContext, WorkerSettings};
use crate::app::worker_pool::WorkerPool;
use crate::config::OrchestratorConfig;
use crate::domain::{OwnerId, TaskId, TaskKind, TaskPayload, TaskRecord};
use crate::error::{BuildError, ControlError, EnqueueError, RelayError, StoreError};
use crate::impls::{BroadcastProgressChannel, InMemoryTaskStore, InMemoryWorkQueue};
use crate::observability::TaskCounts;
use crate::ports::{
    ClientConnection, Clock, IdGenerator, ProgressChannel, Provider, SystemClock, TaskStore,
    UlidGenerator, WorkQueue,
};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(OrchestratorConfig::from_env()?)
///     .in_memory()
///     .with_provider(Arc::new(ScriptedProvider::new("local", "scripted-1")))
///     .build()?;
/// let pool = app.start_workers();
/// ```
pub struct AppBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn TaskStore>>,
    queue: Option<Arc<dyn WorkQueue>>,
    channel: Option<Arc<dyn ProgressChannel>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    providers: Vec<Arc<dyn Provider>>,
    expected_kinds: Vec<TaskKind>,
}

impl AppBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            queue: None,
            channel: None,
            clock: None,
            ids: None,
            providers: Vec::new(),
            expected_kinds: TaskKind::ALL.to_vec(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// In-memory store and queue (single process, nothing survives a restart).
    pub fn in_memory(mut self) -> Self {
        let clock = self.clock();
        self.store = Some(Arc::new(InMemoryTaskStore::new(clock.clone())));
        self.queue = Some(Arc::new(InMemoryWorkQueue::new(
            self.config.queue.claim_timeout,
            clock,
        )));
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn ProgressChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set before `in_memory()` so the store and queue share it.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Task kinds that must have an enabled provider (all kinds by default).
    pub fn expect_kinds(mut self, kinds: &[TaskKind]) -> Self {
        self.expected_kinds = kinds.to_vec();
        self
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock
            .clone()
            .unwrap_or_else(|| Arc::new(SystemClock))
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        let store = self
            .store
            .clone()
            .ok_or(BuildError::MissingComponent("task store"))?;
        let queue = self
            .queue
            .clone()
            .ok_or(BuildError::MissingComponent("work queue"))?;
        let clock = self.clock();
        let channel = self
            .channel
            .clone()
            .unwrap_or_else(|| Arc::new(BroadcastProgressChannel::new()));
        let ids = self
            .ids
            .clone()
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));

        let mut gateway = ProviderGateway::new(self.config.gateway.call_timeout);
        for provider in self.providers {
            gateway.register(provider)?;
        }
        // 設定で指定されたものを先に、残りは対応する最初のプロバイダで埋める
        let mut configured: Vec<_> = self.config.gateway.enabled.iter().collect();
        configured.sort_by_key(|(kind, _)| **kind);
        for (kind, name) in configured {
            gateway.enable(*kind, name)?;
        }
        gateway.enable_defaults(&self.expected_kinds);
        let missing = gateway.unconfigured(&self.expected_kinds);
        if !missing.is_empty() {
            return Err(BuildError::MissingProviders(missing));
        }
        let gateway = Arc::new(gateway);

        let config = self.config;
        let worker_ctx = Arc::new(WorkerContext {
            store: store.clone(),
            queue: queue.clone(),
            channel: channel.clone(),
            gateway: gateway.clone(),
            ids: ids.clone(),
            clock: clock.clone(),
            retry: config.retry.clone(),
            settings: WorkerSettings {
                group: config.queue.group.clone(),
                streams: config.streams(),
                block_timeout: config.queue.block_timeout,
                task_timeout: config.worker.task_timeout,
                progress_ceiling: config.worker.progress_ceiling,
                heartbeat_interval: config.queue.claim_timeout / 3,
            },
        });

        info!(
            group = %config.queue.group,
            streams = ?worker_ctx.settings.streams,
            kinds = self.expected_kinds.len(),
            "orchestrator assembled"
        );

        Ok(App {
            producer: TaskProducer::new(
                store.clone(),
                queue.clone(),
                ids,
                clock.clone(),
                config.queue.topology,
                config.payload,
                config.cost.clone(),
            ),
            canceller: TaskCanceller::new(store.clone()),
            status: StatusQuery::new(store.clone(), clock.clone(), config.reaper.stuck_threshold),
            relay: ProgressRelay::new(
                store.clone(),
                channel,
                config.relay.store_poll_interval,
            ),
            worker_ctx,
            gateway,
            store,
            queue,
            clock,
            config,
        })
    }
}

/// The assembled orchestrator.
pub struct App {
    config: OrchestratorConfig,
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    clock: Arc<dyn Clock>,
    gateway: Arc<ProviderGateway>,
    producer: TaskProducer,
    canceller: TaskCanceller,
    status: StatusQuery,
    relay: ProgressRelay,
    worker_ctx: Arc<WorkerContext>,
}

impl App {
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn gateway(&self) -> &ProviderGateway {
        &self.gateway
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        self.queue.clone()
    }

    pub async fn enqueue(
        &self,
        kind: TaskKind,
        owner: OwnerId,
        payload: serde_json::Value,
    ) -> Result<TaskRecord, EnqueueError> {
        self.producer.enqueue(kind, owner, payload).await
    }

    pub async fn submit(
        &self,
        owner: OwnerId,
        payload: TaskPayload,
    ) -> Result<TaskRecord, EnqueueError> {
        self.producer.submit(owner, payload).await
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskView, ControlError> {
        self.status.status(task_id).await
    }

    pub async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<TaskView>, StoreError> {
        self.status.list_by_owner(owner).await
    }

    pub async fn stuck(&self) -> Result<Vec<TaskView>, StoreError> {
        self.status.stuck().await
    }

    pub async fn counts(&self) -> Result<TaskCounts, StoreError> {
        self.status.counts().await
    }

    pub async fn cancel(&self, task_id: TaskId, caller: &OwnerId) -> Result<TaskRecord, ControlError> {
        self.canceller.cancel(task_id, caller).await
    }

    /// Attach a client connection to one task's progress.
    pub async fn subscribe(
        &self,
        task_id: TaskId,
        conn: Arc<dyn ClientConnection>,
    ) -> Result<RelayHandle, RelayError> {
        self.relay.spawn(task_id, conn).await
    }

    /// A single worker, for driving the pipeline step by step.
    pub fn worker(&self, consumer: impl Into<String>) -> Worker {
        Worker::new(consumer, self.worker_ctx.clone())
    }

    /// Spawn the configured number of workers.
    pub fn start_workers(&self) -> WorkerPool {
        self.start_workers_named(self.config.worker.pool_size, &WorkerPool::default_prefix())
    }

    pub fn start_workers_named(&self, n: usize, prefix: &str) -> WorkerPool {
        WorkerPool::spawn(n, prefix, self.worker_ctx.clone())
    }

    pub fn start_reaper(&self) -> ReaperHandle {
        ReaperLoop::new(
            self.store.clone(),
            self.queue.clone(),
            self.clock.clone(),
            self.config.queue.topology,
            self.config.reaper.clone(),
        )
        .spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::ScriptedProvider;

    fn scripted(name: &str, kinds: &[TaskKind]) -> Arc<dyn Provider> {
        Arc::new(ScriptedProvider::new(name, "scripted-1").supporting(kinds))
    }

    #[test]
    fn build_success_fills_every_kind() {
        let app = AppBuilder::new(OrchestratorConfig::default())
            .in_memory()
            .with_provider(scripted("local", &TaskKind::ALL))
            .build()
            .unwrap();

        for kind in TaskKind::ALL {
            assert_eq!(
                app.gateway().enabled_for(kind).unwrap().descriptor().name,
                "local"
            );
        }
    }

    #[test]
    fn build_fails_when_a_kind_has_no_provider() {
        let app = AppBuilder::new(OrchestratorConfig::default())
            .in_memory()
            .with_provider(scripted("parser", &[TaskKind::DocumentParse]))
            .build();

        assert!(matches!(
            app,
            Err(BuildError::MissingProviders(missing)) if missing.len() == TaskKind::ALL.len() - 1
        ));
    }

    #[test]
    fn expect_kinds_narrows_the_check() {
        let app = AppBuilder::new(OrchestratorConfig::default())
            .in_memory()
            .with_provider(scripted("parser", &[TaskKind::DocumentParse]))
            .expect_kinds(&[TaskKind::DocumentParse])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn configured_provider_wins_over_default() {
        let mut config = OrchestratorConfig::default();
        config
            .gateway
            .enabled
            .insert(TaskKind::DocumentReview, "premium".into());

        let app = AppBuilder::new(config)
            .in_memory()
            .with_provider(scripted("basic", &TaskKind::ALL))
            .with_provider(scripted("premium", &[TaskKind::DocumentReview]))
            .build()
            .unwrap();

        let gateway = app.gateway();
        assert_eq!(
            gateway.enabled_for(TaskKind::DocumentReview).unwrap().descriptor().name,
            "premium"
        );
        assert_eq!(
            gateway.enabled_for(TaskKind::DocumentParse).unwrap().descriptor().name,
            "basic"
        );
    }

    #[test]
    fn missing_store_is_reported() {
        let app = AppBuilder::new(OrchestratorConfig::default())
            .with_provider(scripted("local", &TaskKind::ALL))
            .build();
        assert!(matches!(app, Err(BuildError::MissingComponent("task store"))));
    }

    #[test]
    fn invalid_config_is_rejected_before_anything_else() {
        let mut config = OrchestratorConfig::default();
        config.worker.pool_size = 0;
        let app = AppBuilder::new(config).in_memory().build();
        assert!(matches!(app, Err(BuildError::Config(_))));
    }

    #[test]
    fn duplicate_provider_names_are_rejected() {
        let app = AppBuilder::new(OrchestratorConfig::default())
            .in_memory()
            .with_provider(scripted("local", &TaskKind::ALL))
            .with_provider(scripted("local", &TaskKind::ALL))
            .build();
        assert!(matches!(app, Err(BuildError::Gateway(_))));
    }
}
