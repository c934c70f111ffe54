//! Domain events: the event contract, envelopes, subscribers, and dispatch.

pub mod dispatcher;
pub mod envelope;
pub mod event;
pub mod handler;

pub use dispatcher::{DispatchError, EventDispatcher, InMemoryEventDispatcher};
pub use envelope::{EventEnvelope, JsonEnvelope};
pub use event::Event;
pub use handler::{EventHandler, HandlerError};
