//! Infrastructure layer: storage, dispatch, retries, handlers, config.

pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod ingestion;
pub mod monitoring;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod sweeper;

pub use config::{BusConfig, ConfigError};
pub use dispatcher::{DispatchError, DispatchReport, Dispatcher};
pub use ingestion::{IngestError, IngestOutcome, IngestionService};
pub use monitoring::{BusMonitor, DeadLetter, DeadLetterPage, EventDetail, HealthReport};
pub use retry::RetryManager;
pub use runtime::{HandlerRun, HandlerRuntime};
pub use store::{
    BusStore, EventQuery, EventStore, InMemoryEventStore, PostgresEventStore, StoreError,
    SweepCutoffs,
};
pub use sweeper::{RetrySweeper, SweepReport, SweeperConfig, SweeperHandle, SweeperStats};
