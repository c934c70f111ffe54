//! Unit of Work: transactional persistence of aggregates with domain event dispatch.
//!
//! A [`UnitOfWork`] owns one store transaction at a time, a change tracker holding
//! every aggregate staged through its repositories, and the event dispatcher that
//! receives the events those aggregates raised.
//!
//! ## Transaction lifecycle
//!
//! ```text
//! Idle --begin_transaction--> Active --commit--> Idle
//!                               |   \--rollback--> Idle
//!                               | (any failure)
//!                               v
//!                            Poisoned --rollback--> Idle
//! ```
//!
//! - `begin_transaction` on an active transaction is a no-op.
//! - A failure inside an explicit transaction poisons it: every further operation
//!   returns [`UnitOfWorkError::TransactionAborted`] until `rollback`.
//! - `commit`/`rollback` without a transaction, and `begin_transaction` over a
//!   poisoned one, are programming errors and panic.
//!
//! The intended calling pattern:
//!
//! ```ignore
//! uow.begin_transaction(&ctx).await?;
//! let result = async {
//!     companies.create(company).await?;
//!     uow.commit(&ctx).await
//! }
//! .await;
//! if uow.has_active_transaction().await {
//!     uow.rollback(&ctx).await?;
//! }
//! ```
//!
//! ## Commit and event dispatch
//!
//! `commit` flushes every staged row, collects every pending domain event (tracked
//! aggregates in staging order, then each aggregate's events in raise order),
//! writes them to the outbox in the same store transaction, and commits. Only
//! then are the event queues cleared and the events dispatched, one at a time.
//! A subscriber failure is returned as [`UnitOfWorkError::DispatchFailure`]: the
//! data is already durable and the undelivered events stay pending in the outbox
//! for the relay.
//!
//! ## Without an explicit transaction
//!
//! `save_changes` outside a transaction runs the whole commit sequence in an
//! implicit transaction. Inside one it only flushes: rows become visible to this
//! transaction's queries and events stay queued until `commit`.
//!
//! ## Cancellation
//!
//! Every suspending operation takes a [`CancellationToken`]. Cancellation is
//! honored up to the store commit; once the commit is issued it runs to the end,
//! so a cancelled commit either left nothing behind or completed fully.

mod repository;
mod tracker;

pub use repository::Repository;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bizhub_core::{DomainError, TransactionId};
use bizhub_events::{DispatchError, EventDispatcher, JsonEnvelope};

use crate::outbox;
use crate::store::{OutboxStore, Persistable, StoreError, StoreTransaction, TransactionalStore};

use tracker::ChangeTracker;

/// Unit of Work error.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// Uniqueness violation or stale version token. Never retried here.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Validation or invariant failure reported by the domain.
    #[error(transparent)]
    Domain(DomainError),

    #[error("store error: {0}")]
    Store(StoreError),

    /// An earlier failure poisoned the transaction; roll it back.
    #[error("transaction aborted by an earlier failure; roll it back")]
    TransactionAborted,

    #[error("operation cancelled")]
    Cancelled,

    /// Committed, but a subscriber failed. The first `dispatched` events were
    /// delivered; the rest are pending in the outbox.
    #[error("committed, but event dispatch failed after {dispatched} event(s): {source}")]
    DispatchFailure {
        dispatched: usize,
        #[source]
        source: DispatchError,
    },
}

impl UnitOfWorkError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// The store write became durable even though the operation failed.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::DispatchFailure { .. })
    }
}

impl From<StoreError> for UnitOfWorkError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => UnitOfWorkError::Conflict(msg),
            StoreError::NotFound(msg) => UnitOfWorkError::NotFound(msg),
            other => UnitOfWorkError::Store(other),
        }
    }
}

impl From<DomainError> for UnitOfWorkError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Conflict(msg) => UnitOfWorkError::Conflict(msg),
            DomainError::NotFound(msg) => UnitOfWorkError::NotFound(msg),
            other => UnitOfWorkError::Domain(other),
        }
    }
}

pub(crate) struct ActiveTransaction<Tx> {
    tx: Tx,
    id: TransactionId,
}

pub(crate) enum TxState<Tx> {
    Idle,
    Active(ActiveTransaction<Tx>),
    /// `tx` is `None` once the store transaction itself was consumed or lost.
    Poisoned { tx: Option<Tx>, id: TransactionId },
}

pub(crate) struct Session<Tx> {
    pub(crate) state: TxState<Tx>,
    pub(crate) tracker: ChangeTracker,
}

impl<Tx> Session<Tx> {
    pub(crate) fn poison(&mut self) {
        if let TxState::Active(active) = std::mem::replace(&mut self.state, TxState::Idle) {
            warn!(transaction_id = %active.id, "transaction poisoned; rollback required");
            self.state = TxState::Poisoned {
                tx: Some(active.tx),
                id: active.id,
            };
        }
    }
}

/// State shared by a unit of work and its repositories.
pub(crate) struct Shared<S: TransactionalStore> {
    pub(crate) store: S,
    dispatcher: Arc<dyn EventDispatcher>,
    pub(crate) session: Mutex<Session<S::Transaction>>,
}

/// Flushed rows and collected events, ready for the store commit.
struct Prepared {
    written: usize,
    envelopes: Vec<JsonEnvelope>,
}

/// Transactional boundary over a [`TransactionalStore`].
///
/// Request-scoped: create one per use case invocation. Repositories obtained
/// from [`UnitOfWork::repository`] share its transaction and change tracker.
pub struct UnitOfWork<S: TransactionalStore> {
    shared: Arc<Shared<S>>,
    repositories: std::sync::Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl<S> UnitOfWork<S>
where
    S: TransactionalStore + OutboxStore + 'static,
{
    pub fn new(store: S, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                dispatcher,
                session: Mutex::new(Session {
                    state: TxState::Idle,
                    tracker: ChangeTracker::default(),
                }),
            }),
            repositories: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The repository for `T`, built on first use and cached for this unit of work.
    pub fn repository<T: Persistable>(&self) -> Arc<Repository<T, S>> {
        // A poisoned lock only means another accessor panicked; the map is intact.
        let mut repositories = self.repositories.lock().unwrap_or_else(|e| e.into_inner());
        let key = TypeId::of::<T>();
        if let Some(repository) = repositories
            .get(&key)
            .and_then(|cached| cached.downcast_ref::<Arc<Repository<T, S>>>())
        {
            return Arc::clone(repository);
        }

        let repository = Arc::new(Repository::<T, S>::new(Arc::clone(&self.shared)));
        repositories.insert(key, Box::new(Arc::clone(&repository)));
        repository
    }

    /// Open a store transaction. No-op if one is already active.
    ///
    /// # Panics
    ///
    /// If the current transaction failed and was not rolled back.
    pub async fn begin_transaction(&self, ctx: &CancellationToken) -> Result<(), UnitOfWorkError> {
        let mut session = self.shared.session.lock().await;
        match &session.state {
            TxState::Active(active) => {
                debug!(transaction_id = %active.id, "transaction already active");
                return Ok(());
            }
            TxState::Poisoned { id, .. } => {
                panic!("begin_transaction called over failed transaction {id}; roll it back first")
            }
            TxState::Idle => {}
        }

        let tx = cancellable(ctx, self.shared.store.begin()).await?;
        let id = TransactionId::new();
        session.state = TxState::Active(ActiveTransaction { tx, id });
        debug!(transaction_id = %id, "transaction started");
        Ok(())
    }

    /// Whether a transaction is open, including a failed one awaiting rollback.
    pub async fn has_active_transaction(&self) -> bool {
        !matches!(self.shared.session.lock().await.state, TxState::Idle)
    }

    /// Id of the open transaction, if any.
    pub async fn transaction_id(&self) -> Option<TransactionId> {
        match &self.shared.session.lock().await.state {
            TxState::Idle => None,
            TxState::Active(active) => Some(active.id),
            TxState::Poisoned { id, .. } => Some(*id),
        }
    }

    /// Write staged changes and return the number of rows written.
    ///
    /// Inside a transaction this only flushes. Outside one it flushes, records
    /// the events, commits and dispatches in an implicit transaction; if that
    /// fails before the commit, the staged changes are kept and can be saved again.
    pub async fn save_changes(&self, ctx: &CancellationToken) -> Result<usize, UnitOfWorkError> {
        let mut guard = self.shared.session.lock().await;
        let session = &mut *guard;

        match &mut session.state {
            TxState::Poisoned { .. } => return Err(UnitOfWorkError::TransactionAborted),
            TxState::Active(active) => {
                let id = active.id;
                let result = flush(&mut active.tx, &mut session.tracker, ctx).await;
                match result {
                    Ok(written) => {
                        debug!(transaction_id = %id, written, "changes flushed");
                        return Ok(written);
                    }
                    Err(err) => {
                        session.poison();
                        return Err(err);
                    }
                }
            }
            TxState::Idle => {}
        }

        if session.tracker.dirty_count() == 0 && session.tracker.pending_event_count() == 0 {
            return Ok(0);
        }

        let mut tx = cancellable(ctx, self.shared.store.begin()).await?;
        let id = TransactionId::new();

        let prepared = match prepare(&mut tx, &mut session.tracker, id, ctx).await {
            Ok(prepared) => prepared,
            Err(err) => {
                session.tracker.reset_flushes();
                rollback_quietly(tx, id).await;
                return Err(err);
            }
        };

        if let Err(err) = tx.commit().await {
            session.tracker.reset_flushes();
            warn!(transaction_id = %id, error = %err, "implicit transaction commit failed");
            return Err(err.into());
        }

        let cleared = session.tracker.confirm_commit();
        session.tracker.clear();
        drop(guard);

        info!(
            transaction_id = %id,
            written = prepared.written,
            events = cleared,
            "changes saved"
        );
        self.dispatch(prepared.envelopes).await?;
        Ok(prepared.written)
    }

    /// Flush, record events, commit, then dispatch the events.
    ///
    /// On `Err` other than [`UnitOfWorkError::DispatchFailure`] nothing was
    /// committed and the transaction is poisoned: roll it back.
    ///
    /// # Panics
    ///
    /// If no transaction is active.
    pub async fn commit(&self, ctx: &CancellationToken) -> Result<(), UnitOfWorkError> {
        let mut guard = self.shared.session.lock().await;
        let session = &mut *guard;

        let mut active = match std::mem::replace(&mut session.state, TxState::Idle) {
            TxState::Active(active) => active,
            TxState::Idle => panic!("commit called without an active transaction"),
            poisoned @ TxState::Poisoned { .. } => {
                session.state = poisoned;
                return Err(UnitOfWorkError::TransactionAborted);
            }
        };
        let id = active.id;
        // Until the commit completes, an interrupted call leaves a failed transaction.
        session.state = TxState::Poisoned { tx: None, id };

        let prepared = match prepare(&mut active.tx, &mut session.tracker, id, ctx).await {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(transaction_id = %id, error = %err, "commit aborted before the store commit");
                session.state = TxState::Poisoned {
                    tx: Some(active.tx),
                    id,
                };
                return Err(err);
            }
        };

        if let Err(err) = active.tx.commit().await {
            warn!(transaction_id = %id, error = %err, "store commit failed");
            return Err(err.into());
        }

        session.state = TxState::Idle;
        let cleared = session.tracker.confirm_commit();
        session.tracker.clear();
        drop(guard);

        info!(
            transaction_id = %id,
            written = prepared.written,
            events = cleared,
            "transaction committed"
        );
        self.dispatch(prepared.envelopes).await
    }

    /// Discard the transaction and every staged change. Nothing is dispatched.
    ///
    /// # Panics
    ///
    /// If no transaction is active.
    pub async fn rollback(&self, ctx: &CancellationToken) -> Result<(), UnitOfWorkError> {
        let mut guard = self.shared.session.lock().await;
        let session = &mut *guard;

        let (tx, id) = match std::mem::replace(&mut session.state, TxState::Idle) {
            TxState::Idle => panic!("rollback called without an active transaction"),
            TxState::Active(active) => (Some(active.tx), active.id),
            TxState::Poisoned { tx, id } => (tx, id),
        };
        let discarded = session.tracker.len();
        session.tracker.clear();

        if let Some(tx) = tx {
            // Dropping a store transaction also rolls it back.
            tokio::select! {
                biased;
                _ = ctx.cancelled() => debug!(transaction_id = %id, "rollback cancelled; transaction dropped"),
                result = tx.rollback() => {
                    if let Err(err) = result {
                        warn!(transaction_id = %id, error = %err, "store rollback failed");
                        return Err(err.into());
                    }
                }
            }
        }

        info!(transaction_id = %id, discarded, "transaction rolled back");
        Ok(())
    }

    async fn dispatch(&self, envelopes: Vec<JsonEnvelope>) -> Result<(), UnitOfWorkError> {
        if envelopes.is_empty() {
            return Ok(());
        }
        outbox::deliver(&*self.shared.dispatcher, &self.shared.store, &envelopes)
            .await
            .map(|_| ())
            .map_err(|(dispatched, source)| UnitOfWorkError::DispatchFailure { dispatched, source })
    }
}

impl<S: TransactionalStore> core::fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnitOfWork").finish_non_exhaustive()
    }
}

/// Race a store operation against cancellation.
pub(crate) async fn cancellable<T, F>(ctx: &CancellationToken, operation: F) -> Result<T, UnitOfWorkError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(UnitOfWorkError::Cancelled),
        result = operation => result.map_err(UnitOfWorkError::from),
    }
}

/// Write every dirty tracked aggregate.
async fn flush<Tx: StoreTransaction>(
    tx: &mut Tx,
    tracker: &mut ChangeTracker,
    ctx: &CancellationToken,
) -> Result<usize, UnitOfWorkError> {
    let mut written = 0;
    for entry in tracker.entries_mut().filter(|e| e.is_dirty()) {
        let row = entry.row_write()?;
        let key = entry.key();
        match cancellable(ctx, tx.write(row)).await {
            Ok(version) => entry.mark_flushed(version),
            Err(err) => {
                if err.is_conflict() {
                    warn!(kind = key.kind, id = %key.id, error = %err, "optimistic concurrency conflict");
                }
                return Err(err);
            }
        }
        written += 1;
    }
    Ok(written)
}

/// Flush, collect events, stage them in the outbox. Everything short of the commit.
async fn prepare<Tx: StoreTransaction>(
    tx: &mut Tx,
    tracker: &mut ChangeTracker,
    transaction_id: TransactionId,
    ctx: &CancellationToken,
) -> Result<Prepared, UnitOfWorkError> {
    let written = flush(tx, tracker, ctx).await?;
    let envelopes = tracker.collect_events(transaction_id)?;
    if !envelopes.is_empty() {
        cancellable(ctx, tx.enqueue_outbox(envelopes.clone())).await?;
    }
    if ctx.is_cancelled() {
        return Err(UnitOfWorkError::Cancelled);
    }
    Ok(Prepared { written, envelopes })
}

async fn rollback_quietly<Tx: StoreTransaction>(tx: Tx, transaction_id: TransactionId) {
    if let Err(err) = tx.rollback().await {
        warn!(transaction_id = %transaction_id, error = %err, "rollback of implicit transaction failed");
    }
}
