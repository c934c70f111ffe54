use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bizhub_core::{Specification, VersionToken};

use super::{Shared, TxState, UnitOfWorkError, cancellable};
use crate::store::{Persistable, SelectOptions, StoreTransaction, TransactionalStore};

/// Typed access to the aggregates of one kind within a [`super::UnitOfWork`].
///
/// Writes are staged in the unit of work's change tracker and reach the store on
/// `save_changes`/`commit`. Reads go to the store: inside a transaction they see
/// its flushed writes, outside one they run in a short read-only transaction.
/// Staged but unflushed changes are never visible to reads.
///
/// Soft-deleted aggregates are filtered out unless
/// [`Repository::query_including_deleted`] is used.
pub struct Repository<T, S: TransactionalStore> {
    shared: Arc<Shared<S>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, S> Repository<T, S>
where
    T: Persistable,
    S: TransactionalStore,
{
    pub(crate) fn new(shared: Arc<Shared<S>>) -> Self {
        Self {
            shared,
            _entity: PhantomData,
        }
    }

    /// Stage a new aggregate. Writing it fails with `Conflict` if the id exists.
    pub async fn create(&self, entity: T) -> Result<(), UnitOfWorkError> {
        let mut session = self.shared.session.lock().await;
        if matches!(session.state, TxState::Poisoned { .. }) {
            return Err(UnitOfWorkError::TransactionAborted);
        }
        debug!(kind = T::AGGREGATE_TYPE, id = %entity.id(), "staged create");
        session.tracker.stage(entity, VersionToken::UNSAVED);
        Ok(())
    }

    /// Stage changes to a loaded aggregate.
    ///
    /// The write succeeds only if the stored row still carries the version token
    /// the aggregate was loaded with; otherwise it fails with `Conflict`.
    pub async fn update(&self, entity: T) -> Result<(), UnitOfWorkError> {
        let mut session = self.shared.session.lock().await;
        if matches!(session.state, TxState::Poisoned { .. }) {
            return Err(UnitOfWorkError::TransactionAborted);
        }
        if entity.version().is_unsaved() && !session.tracker.is_tracked(T::AGGREGATE_TYPE, entity.id()) {
            return Err(UnitOfWorkError::NotFound(format!(
                "{} {} was never saved",
                T::AGGREGATE_TYPE,
                entity.id()
            )));
        }
        debug!(kind = T::AGGREGATE_TYPE, id = %entity.id(), version = %entity.version(), "staged update");
        let base = entity.version();
        session.tracker.stage(entity, base);
        Ok(())
    }

    /// Stage a soft delete.
    ///
    /// Aggregates that already marked themselves deleted (raising their own
    /// removal event) are staged as they are.
    pub async fn delete(&self, mut entity: T) -> Result<(), UnitOfWorkError> {
        if !entity.is_deleted() {
            entity.metadata_mut().mark_deleted(Utc::now())?;
        }
        self.update(entity).await
    }

    /// First aggregate matching `spec`, in insertion order.
    pub async fn find_one(
        &self,
        spec: &Specification<T>,
        ctx: &CancellationToken,
    ) -> Result<Option<T>, UnitOfWorkError> {
        let mut found = self.select(spec, SelectOptions::live().limit(1), ctx).await?;
        Ok(found.pop())
    }

    pub async fn exists(&self, spec: &Specification<T>, ctx: &CancellationToken) -> Result<bool, UnitOfWorkError> {
        Ok(self.find_one(spec, ctx).await?.is_some())
    }

    /// Every aggregate matching `spec`, in insertion order.
    ///
    /// The result is a snapshot; query again to observe later writes.
    pub async fn query(&self, spec: &Specification<T>, ctx: &CancellationToken) -> Result<Vec<T>, UnitOfWorkError> {
        self.select(spec, SelectOptions::live(), ctx).await
    }

    /// Like [`Repository::query`], but soft-deleted aggregates take part too.
    pub async fn query_including_deleted(
        &self,
        spec: &Specification<T>,
        ctx: &CancellationToken,
    ) -> Result<Vec<T>, UnitOfWorkError> {
        self.select(spec, SelectOptions::including_deleted(), ctx).await
    }

    async fn select(
        &self,
        spec: &Specification<T>,
        options: SelectOptions,
        ctx: &CancellationToken,
    ) -> Result<Vec<T>, UnitOfWorkError> {
        let mut guard = self.shared.session.lock().await;
        match &mut guard.state {
            TxState::Poisoned { .. } => return Err(UnitOfWorkError::TransactionAborted),
            TxState::Active(active) => {
                let result = cancellable(ctx, active.tx.select(spec, options)).await;
                if result.is_err() {
                    guard.poison();
                }
                return result;
            }
            TxState::Idle => {}
        }
        drop(guard);

        let mut tx = cancellable(ctx, self.shared.store.begin()).await?;
        let result = cancellable(ctx, tx.select(spec, options)).await;
        if let Err(err) = tx.rollback().await {
            debug!(error = %err, "read transaction rollback failed");
        }
        result
    }
}

impl<T, S: TransactionalStore> core::fmt::Debug for Repository<T, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}
