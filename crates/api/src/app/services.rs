//! Infrastructure wiring: store, registry, dispatcher, sweeper and monitor.
//!
//! `USE_PERSISTENT_STORES` picks Postgres; otherwise everything lives in
//! memory (dev/test).

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::info;

use marketflow_core::{Clock, SystemClock};
use marketflow_events::RegistryError;
use marketflow_infra::handlers::{InMemoryPorts, standard_registry};
use marketflow_infra::{
    BusConfig, BusMonitor, BusStore, Dispatcher, HandlerRuntime, InMemoryEventStore,
    IngestionService, PostgresEventStore, RetryManager, RetrySweeper, StoreError,
};

/// The store every service shares, erased so one router serves both backends.
pub type SharedStore = Arc<dyn BusStore>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Clone)]
pub struct AppServices {
    pub ingestion: Arc<IngestionService<SharedStore>>,
    pub monitor: Arc<BusMonitor<SharedStore>>,
    /// Collaborators behind the standard handlers.
    pub ports: InMemoryPorts,
    pub config: BusConfig,
}

impl AppServices {
    pub fn dispatcher(&self) -> &Arc<Dispatcher<SharedStore>> {
        self.ingestion.dispatcher()
    }

    /// A sweeper over the same dispatcher the ingestion path uses.
    pub fn sweeper(&self) -> RetrySweeper<SharedStore> {
        RetrySweeper::new(Arc::clone(self.dispatcher()), self.config.sweeper.clone())
    }
}

pub async fn build_services(config: BusConfig) -> Result<AppServices, ServiceError> {
    let store: SharedStore = match config.database_url.as_deref() {
        Some(database_url) if config.use_persistent_stores => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await?;
            let store = PostgresEventStore::new(pool);
            store.ensure_schema().await?;
            info!("using postgres event store");
            Arc::new(store)
        }
        _ => {
            info!("using in-memory event store");
            Arc::new(InMemoryEventStore::new())
        }
    };

    wire(store, config, Arc::new(SystemClock))
}

/// In-memory wiring with a caller-supplied clock (tests).
pub fn build_in_memory_services(
    config: BusConfig,
    clock: Arc<dyn Clock>,
) -> Result<AppServices, ServiceError> {
    wire(Arc::new(InMemoryEventStore::new()), config, clock)
}

fn wire(
    store: SharedStore,
    config: BusConfig,
    clock: Arc<dyn Clock>,
) -> Result<AppServices, ServiceError> {
    let ports = InMemoryPorts::new();
    let registry = standard_registry(&ports.ports(), Arc::clone(&clock))?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(registry),
        HandlerRuntime::new(config.handler_timeout),
        RetryManager::new(config.retry.clone()),
        Arc::clone(&clock),
    ));

    Ok(AppServices {
        ingestion: Arc::new(IngestionService::new(dispatcher)),
        monitor: Arc::new(BusMonitor::new(store, clock)),
        ports,
        config,
    })
}
