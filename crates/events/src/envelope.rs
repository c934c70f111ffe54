use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bizhub_core::{EntityId, TransactionId};

use crate::Event;

/// Envelope for a domain event, carrying the metadata of the commit that produced it.
///
/// This is the unit written to the outbox and handed to subscribers.
///
/// Notes:
/// - `transaction_id` identifies the unit-of-work commit that collected the event.
/// - `sequence` is the event's position in that commit's collection order
///   (tracked aggregates in staging order, then each aggregate's events in the
///   order they were raised).
/// - `payload` is the event itself, or its JSON form once it crosses the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    transaction_id: TransactionId,
    sequence: u32,

    aggregate_id: EntityId,
    aggregate_type: String,

    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,

    payload: E,
}

/// Envelope whose payload has been serialized for transport.
pub type JsonEnvelope = EventEnvelope<serde_json::Value>;

impl<E: Event> EventEnvelope<E> {
    /// Wrap an event raised by the aggregate `aggregate_id`.
    pub fn wrap(
        transaction_id: TransactionId,
        sequence: u32,
        aggregate_id: EntityId,
        aggregate_type: impl Into<String>,
        payload: E,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            transaction_id,
            sequence,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: payload.event_type().to_string(),
            event_version: payload.version(),
            occurred_at: payload.occurred_at(),
            payload,
        }
    }
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn aggregate_id(&self) -> EntityId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Serialize the payload, keeping every piece of metadata.
    pub fn to_json(&self) -> Result<JsonEnvelope, serde_json::Error>
    where
        E: Serialize,
    {
        Ok(EventEnvelope {
            event_id: self.event_id,
            transaction_id: self.transaction_id,
            sequence: self.sequence,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type.clone(),
            event_type: self.event_type.clone(),
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            payload: serde_json::to_value(&self.payload)?,
        })
    }
}

impl JsonEnvelope {
    /// Deserialize the payload into a concrete event type.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pinged {
        at: DateTime<Utc>,
    }

    impl Event for Pinged {
        fn event_type(&self) -> &'static str {
            "test.pinged"
        }

        fn version(&self) -> u32 {
            2
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn wrap_copies_event_metadata() {
        let at = Utc::now();
        let tx = TransactionId::new();
        let aggregate = EntityId::new();
        let envelope = EventEnvelope::wrap(tx, 3, aggregate, "test.probe", Pinged { at });

        assert_eq!(envelope.event_type(), "test.pinged");
        assert_eq!(envelope.event_version(), 2);
        assert_eq!(envelope.occurred_at(), at);
        assert_eq!(envelope.transaction_id(), tx);
        assert_eq!(envelope.sequence(), 3);
        assert_eq!(envelope.aggregate_id(), aggregate);
        assert_eq!(envelope.aggregate_type(), "test.probe");
    }

    #[test]
    fn json_envelope_decodes_back_to_the_event() {
        let event = Pinged { at: Utc::now() };
        let envelope = EventEnvelope::wrap(TransactionId::new(), 0, EntityId::new(), "test.probe", event.clone());

        let json = envelope.to_json().unwrap();
        assert_eq!(json.event_id(), envelope.event_id());
        assert_eq!(json.decode::<Pinged>().unwrap(), event);
    }
}
