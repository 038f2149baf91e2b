//! Bus events, handler contract and routing.
//!
//! Pure model: no storage, no runtime. The infra crate persists these types
//! and drives the handlers.

pub mod event;
pub mod handler;
pub mod ingest;
pub mod log;
pub mod registry;
pub mod retry;

pub use event::{
    AttemptResolution, EventRecord, EventStatus, NewEvent, default_aggregate_type,
    idempotency_key,
};
pub use handler::{EventHandler, FnHandler, HandlerContext, HandlerError, handler_fn};
pub use ingest::{IngestRequest, IngestValidationError};
pub use log::{HandlerExecutionLog, HandlerRunStatus};
pub use registry::{
    HandlerCatalog, HandlerRegistry, NamedHandler, RegistryError, RoutingTable, names,
};
pub use retry::{BackoffStrategy, RetryPolicy};
