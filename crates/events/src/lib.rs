//! Workflow and ledger events plus the in-process bus they travel on.
//!
//! Events are published only after the state change they describe has been
//! committed. Consumers (audit writers, notification senders, read models)
//! must tolerate duplicates.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
