//! Event storage: write-side state machine plus operator queries.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{EventFilter, EventPage, EventQuery, HandlerStats, Pagination, StatusCounts};
pub use r#trait::{Claim, EventStore, InsertOutcome, StoreError, SweepCutoffs};

/// A store that serves both the dispatch path and the operator views.
pub trait BusStore: EventStore + EventQuery {}

impl<T> BusStore for T where T: EventStore + EventQuery + ?Sized {}
