//! Event dispatch: deliver committed events to subscribers.

use std::sync::{Arc, RwLock};

use thiserror::Error;
use uuid::Uuid;

use crate::{EventHandler, HandlerError, JsonEnvelope};

/// A subscriber rejected an event.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handler `{handler}` failed on event {event_id} ({event_type}): {source}")]
    Handler {
        handler: &'static str,
        event_id: Uuid,
        event_type: String,
        #[source]
        source: HandlerError,
    },
}

/// Delivers a single committed event to every subscriber.
///
/// Implementations must invoke subscribers sequentially and stop at the first
/// failure, returning it to the caller.
#[async_trait::async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, envelope: &JsonEnvelope) -> Result<(), DispatchError>;
}

#[async_trait::async_trait]
impl<D> EventDispatcher for Arc<D>
where
    D: EventDispatcher + ?Sized,
{
    async fn dispatch(&self, envelope: &JsonEnvelope) -> Result<(), DispatchError> {
        (**self).dispatch(envelope).await
    }
}

/// In-process dispatcher.
///
/// - No IO of its own
/// - Subscribers run in registration order, one at a time
/// - The first subscriber error aborts delivery of that event
#[derive(Default)]
pub struct InMemoryEventDispatcher {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl InMemoryEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        // A poisoned lock only means another subscribe panicked; the vector is intact.
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventHandler>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl core::fmt::Debug for InMemoryEventDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<_> = self.snapshot().iter().map(|h| h.name()).collect();
        f.debug_struct("InMemoryEventDispatcher")
            .field("handlers", &names)
            .finish()
    }
}

#[async_trait::async_trait]
impl EventDispatcher for InMemoryEventDispatcher {
    async fn dispatch(&self, envelope: &JsonEnvelope) -> Result<(), DispatchError> {
        for handler in self.snapshot() {
            tracing::debug!(
                handler = handler.name(),
                event_id = %envelope.event_id(),
                event_type = envelope.event_type(),
                "delivering event"
            );
            handler
                .handle(envelope)
                .await
                .map_err(|source| DispatchError::Handler {
                    handler: handler.name(),
                    event_id: envelope.event_id(),
                    event_type: envelope.event_type().to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use bizhub_core::{EntityId, TransactionId};

    use super::*;
    use crate::{Event, EventEnvelope};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Noted {
        at: DateTime<Utc>,
    }

    impl Event for Noted {
        fn event_type(&self) -> &'static str {
            "test.noted"
        }

        fn version(&self) -> u32 {
            1
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, _envelope: &JsonEnvelope) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                Err(HandlerError::failed("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn envelope() -> JsonEnvelope {
        EventEnvelope::wrap(TransactionId::new(), 0, EntityId::new(), "test.probe", Noted { at: Utc::now() })
            .to_json()
            .unwrap()
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<dyn EventHandler> {
        Arc::new(Recorder {
            name,
            log: Arc::clone(log),
            fail,
        })
    }

    #[tokio::test]
    async fn delivers_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = InMemoryEventDispatcher::new();
        dispatcher.subscribe(recorder("first", &log, false));
        dispatcher.subscribe(recorder("second", &log, false));

        dispatcher.dispatch(&envelope()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn first_failure_stops_delivery_and_propagates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = InMemoryEventDispatcher::new();
        dispatcher.subscribe(recorder("failing", &log, true));
        dispatcher.subscribe(recorder("never", &log, false));

        let envelope = envelope();
        match dispatcher.dispatch(&envelope).await {
            Err(DispatchError::Handler { handler, event_id, .. }) => {
                assert_eq!(handler, "failing");
                assert_eq!(event_id, envelope.event_id());
            }
            other => panic!("Expected handler failure, got {other:?}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["failing"]);
    }

    #[tokio::test]
    async fn no_subscribers_is_ok() {
        let dispatcher = InMemoryEventDispatcher::new();
        assert_eq!(dispatcher.handler_count(), 0);
        dispatcher.dispatch(&envelope()).await.unwrap();
    }
}
