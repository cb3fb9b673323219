//! Infrastructure wiring: store, bus, relay, orchestrator, streams, read models, cache.

use std::sync::Arc;

use tracing::info;

use eventide_domain::{DomainAggregate, DomainTopics};
use eventide_events::{InMemoryEventBus, SubscriptionPattern, TopicResolver};
use eventide_infra::cache::{spawn_invalidator, CacheConfig, InvalidatingCache};
use eventide_infra::event_store::{EventStore, InMemoryEventStore, PostgresEventStore, StoreError};
use eventide_infra::projections::{DirectoryProjection, TypeStats};
use eventide_infra::stream::{StreamConfig, StreamManager};
use eventide_infra::workers::{ProjectionWorker, WorkerHandle};
use eventide_infra::{
    CommandOrchestrator, CommitNotifier, EventRelay, OrchestratorConfig, RelayConfig, RetryPolicy,
};

use crate::config::AppConfig;

pub type SharedStore = Arc<dyn EventStore>;
pub type SharedBus = Arc<InMemoryEventBus>;
pub type Orchestrator = CommandOrchestrator<SharedStore, DomainAggregate>;
pub type Streams = StreamManager<SharedStore, SharedBus>;

/// Everything the HTTP handlers need, shared behind an `Arc`.
///
/// Dropping the services stops the background workers (relay, directory
/// worker, cache invalidator).
pub struct AppServices {
    pub orchestrator: Orchestrator,
    pub store: SharedStore,
    pub bus: SharedBus,
    pub streams: Arc<Streams>,
    pub directory: Arc<DirectoryProjection>,
    pub stats_cache: Arc<InvalidatingCache<TypeStats>>,
    workers: Vec<WorkerHandle>,
}

impl AppServices {
    /// Stop background workers and wait for them.
    pub async fn shutdown(self) {
        self.bus.close();
        for worker in self.workers {
            worker.shutdown().await;
        }
    }
}

pub async fn build_services(config: &AppConfig) -> Result<AppServices, StoreError> {
    let store: SharedStore = match &config.database_url {
        Some(url) => {
            info!("using Postgres event store");
            Arc::new(PostgresEventStore::connect(url).await?)
        }
        None => {
            info!("DATABASE_URL not set; using in-memory event store");
            Arc::new(InMemoryEventStore::new())
        }
    };
    wire(store, config).await
}

async fn wire(store: SharedStore, config: &AppConfig) -> Result<AppServices, StoreError> {
    let bus: SharedBus = Arc::new(InMemoryEventBus::with_capacity(config.subscriber_buffer));
    let topics: Arc<dyn TopicResolver> = Arc::new(DomainTopics);
    let notifier = CommitNotifier::new();

    let relay = EventRelay::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&topics),
        RelayConfig {
            poll_interval: config.relay_poll_interval,
            batch_size: config.replay_batch_size,
        },
    )
    .spawn(notifier.clone())
    .await?;

    let stream_config = StreamConfig {
        heartbeat_interval: config.heartbeat_interval,
        replay_batch_size: config.replay_batch_size,
    };

    // The directory rebuilds from the whole log on startup, then follows it.
    let directory = Arc::new(DirectoryProjection::new(Arc::clone(&topics)));
    let directory_worker = ProjectionWorker::spawn(
        "directory",
        Arc::new(StreamManager::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&topics),
            stream_config.clone(),
        )),
        SubscriptionPattern::all(),
        Arc::clone(&directory),
    );

    let streams = Arc::new(
        StreamManager::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&topics),
            stream_config,
        )
        .with_snapshots(Arc::clone(&directory) as _),
    );

    let stats_cache = Arc::new(InvalidatingCache::new(CacheConfig {
        default_ttl: config.cache_ttl,
        time_to_idle: Some(config.cache_tti),
        ..CacheConfig::default()
    }));
    let invalidator = spawn_invalidator(Arc::clone(&stats_cache), &*bus);

    let orchestrator = CommandOrchestrator::with_config(
        Arc::clone(&store),
        notifier,
        OrchestratorConfig {
            command_timeout: config.command_timeout,
            snapshot_every: config.snapshot_every,
            retry: RetryPolicy::default().with_max_attempts(config.retry_max_attempts),
        },
    );

    Ok(AppServices {
        orchestrator,
        store,
        bus,
        streams,
        directory,
        stats_cache,
        workers: vec![relay, directory_worker, invalidator],
    })
}
