use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use bizhub_core::{
    AggregateRoot, EntityId, ExpectedVersion, Fields, Specification, VersionToken,
};
use bizhub_events::{Event as DomainEvent, JsonEnvelope};

use super::sql_filter::TranslateError;

/// An aggregate the store can persist as a JSON document and query with specifications.
///
/// Blanket-implemented; domain types only need the listed traits.
pub trait Persistable:
    AggregateRoot<Event: DomainEvent + Serialize> + Fields + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Persistable for T where
    T: AggregateRoot<Event: DomainEvent + Serialize>
        + Fields
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// A single staged row write.
///
/// `expected` decides the statement: [`ExpectedVersion::Absent`] inserts,
/// [`ExpectedVersion::Exact`] updates only if the stored token still matches.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub kind: &'static str,
    pub id: EntityId,
    pub expected: ExpectedVersion,
    pub deleted: bool,
    pub document: JsonValue,
}

/// Whether soft-deleted rows take part in a read.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Visibility {
    /// Default filter: soft-deleted rows are invisible.
    #[default]
    ExcludeDeleted,
    IncludeDeleted,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SelectOptions {
    pub visibility: Visibility,
    pub limit: Option<usize>,
}

impl SelectOptions {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn including_deleted() -> Self {
        Self {
            visibility: Visibility::IncludeDeleted,
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Store operation error.
///
/// These are **infrastructure errors** as opposed to domain errors (validation,
/// invariants). `Conflict` and `NotFound` keep their domain meaning so the unit of
/// work can surface them unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Insert of an existing row, or a stale version token on update.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Update of a row that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("filter translation failed: {0}")]
    Translation(#[from] TranslateError),

    /// Connection, driver or storage engine failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Entry point of a storage backend: opens transactions.
#[async_trait::async_trait]
pub trait TransactionalStore: Send + Sync {
    type Transaction: StoreTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

/// An open store transaction.
///
/// Every write and read goes through a transaction; nothing becomes visible to
/// other transactions before [`StoreTransaction::commit`]. Dropping a transaction
/// without committing discards it.
///
/// After any method returns an error the transaction must only be rolled back.
#[async_trait::async_trait]
pub trait StoreTransaction: Send {
    /// Insert or update one row, comparing version tokens atomically.
    ///
    /// Returns the token the row carries after the write.
    async fn write(&mut self, row: RowWrite) -> Result<VersionToken, StoreError>;

    /// Rows of `T` matching `spec`, in insertion order, each carrying its current
    /// version token. Sees this transaction's own writes.
    async fn select<T: Persistable>(
        &mut self,
        spec: &Specification<T>,
        options: SelectOptions,
    ) -> Result<Vec<T>, StoreError>;

    /// Stage outbox records; they become pending atomically with the row writes.
    async fn enqueue_outbox(&mut self, records: Vec<JsonEnvelope>) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Durable record of committed events awaiting delivery.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Undelivered records, oldest first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<JsonEnvelope>, StoreError>;

    async fn mark_delivered(&self, event_ids: &[Uuid]) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S> TransactionalStore for Arc<S>
where
    S: TransactionalStore + ?Sized,
{
    type Transaction = S::Transaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        (**self).begin().await
    }
}

#[async_trait::async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<JsonEnvelope>, StoreError> {
        (**self).pending_outbox(limit).await
    }

    async fn mark_delivered(&self, event_ids: &[Uuid]) -> Result<(), StoreError> {
        (**self).mark_delivered(event_ids).await
    }
}
