//! `marketflow-core`: shared building blocks for the event bus.
//!
//! Identifiers, the clock abstraction and the domain error model. No IO.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{EventId, LogId};
