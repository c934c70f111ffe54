//! Integration tests for the unit of work pipeline.
//!
//! Tests: Repository → UnitOfWork → Store (+ outbox) → EventDispatcher → subscribers
//!
//! Verifies:
//! - Nothing is dispatched unless the store write committed
//! - Rollback and failed transactions leave no trace in the store
//! - Optimistic concurrency conflicts keep the winning write
//! - Undelivered events are redelivered by the outbox relay

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bizhub_companies::{Company, User, UserRole, specs};
use bizhub_core::{Entity, EntityId, Specification, VersionToken};
use bizhub_events::{EventHandler, HandlerError, InMemoryEventDispatcher, JsonEnvelope};

use crate::outbox::OutboxRelay;
use crate::store::{
    InMemoryStore, InMemoryTransaction, OutboxStore, Persistable, RowWrite, SelectOptions,
    StoreError, StoreTransaction, TransactionalStore,
};
use crate::unit_of_work::{UnitOfWork, UnitOfWorkError};

/// Wraps [`InMemoryStore`] and injects failures.
#[derive(Debug, Clone, Default)]
struct FlakyStore {
    inner: InMemoryStore,
    /// Writes of this aggregate type fail with a backend error.
    fail_writes_of: Arc<Mutex<Option<&'static str>>>,
    /// The next store commit fails.
    fail_next_commit: Arc<AtomicBool>,
}

impl FlakyStore {
    fn failing_writes_of(kind: &'static str) -> Self {
        let store = Self::default();
        *store.fail_writes_of.lock().unwrap() = Some(kind);
        store
    }
}

struct FlakyTransaction {
    inner: InMemoryTransaction,
    fail_writes_of: Option<&'static str>,
    fail_commit: bool,
}

#[async_trait::async_trait]
impl TransactionalStore for FlakyStore {
    type Transaction = FlakyTransaction;

    async fn begin(&self) -> Result<FlakyTransaction, StoreError> {
        Ok(FlakyTransaction {
            inner: self.inner.begin().await?,
            fail_writes_of: *self.fail_writes_of.lock().unwrap(),
            fail_commit: self.fail_next_commit.swap(false, Ordering::SeqCst),
        })
    }
}

#[async_trait::async_trait]
impl OutboxStore for FlakyStore {
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<JsonEnvelope>, StoreError> {
        self.inner.pending_outbox(limit).await
    }

    async fn mark_delivered(&self, event_ids: &[Uuid]) -> Result<(), StoreError> {
        self.inner.mark_delivered(event_ids).await
    }
}

#[async_trait::async_trait]
impl StoreTransaction for FlakyTransaction {
    async fn write(&mut self, row: RowWrite) -> Result<VersionToken, StoreError> {
        if self.fail_writes_of == Some(row.kind) {
            return Err(StoreError::Backend(format!("injected write failure for {}", row.kind)));
        }
        self.inner.write(row).await
    }

    async fn select<T: Persistable>(
        &mut self,
        spec: &Specification<T>,
        options: SelectOptions,
    ) -> Result<Vec<T>, StoreError> {
        self.inner.select(spec, options).await
    }

    async fn enqueue_outbox(&mut self, records: Vec<JsonEnvelope>) -> Result<(), StoreError> {
        self.inner.enqueue_outbox(records).await
    }

    async fn commit(self) -> Result<(), StoreError> {
        if self.fail_commit {
            return Err(StoreError::Backend("injected commit failure".to_string()));
        }
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

/// Records every delivered event type; can be told to reject events.
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingHandler {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn handle(&self, envelope: &JsonEnvelope) -> Result<(), HandlerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HandlerError::failed("subscriber unavailable"));
        }
        self.seen.lock().unwrap().push(envelope.event_type().to_string());
        Ok(())
    }
}

fn setup<S>(store: S) -> (UnitOfWork<S>, Arc<RecordingHandler>, Arc<InMemoryEventDispatcher>)
where
    S: TransactionalStore + OutboxStore + 'static,
{
    let handler = Arc::new(RecordingHandler::default());
    let dispatcher = Arc::new(InMemoryEventDispatcher::new());
    dispatcher.subscribe(handler.clone());
    (UnitOfWork::new(store, dispatcher.clone()), handler, dispatcher)
}

fn acme() -> Company {
    Company::register(EntityId::new(), "Acme", "12345678000190", Utc::now()).unwrap()
}

fn admin_of(company: &Company) -> User {
    User::register(
        EntityId::new(),
        company.id(),
        "admin@acme.example",
        "Admin",
        UserRole::Admin,
        Utc::now(),
    )
    .unwrap()
}

#[tokio::test]
async fn committed_events_are_dispatched_in_collection_order() {
    let store = InMemoryStore::new();
    let (uow, handler, _) = setup(store.clone());
    let ctx = CancellationToken::new();

    let company = acme();
    let mut user = admin_of(&company);
    user.request_welcome_email(Utc::now()).unwrap();

    uow.begin_transaction(&ctx).await.unwrap();
    uow.repository::<Company>().create(company).await.unwrap();
    uow.repository::<User>().create(user).await.unwrap();
    assert!(handler.seen().is_empty());
    uow.commit(&ctx).await.unwrap();

    assert_eq!(
        handler.seen(),
        vec![
            "companies.company.registered",
            "companies.user.registered",
            "companies.user.welcome_email_requested",
        ]
    );
    assert!(store.pending_outbox(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn updating_a_clone_of_a_staged_aggregate_dispatches_each_event_once() {
    let store = InMemoryStore::new();
    let (uow, handler, _) = setup(store.clone());
    let ctx = CancellationToken::new();
    let companies = uow.repository::<Company>();

    let mut company = acme();
    uow.begin_transaction(&ctx).await.unwrap();
    companies.create(company.clone()).await.unwrap();
    company.rename("Acme Holdings", Utc::now()).unwrap();
    companies.update(company).await.unwrap();
    uow.commit(&ctx).await.unwrap();

    assert_eq!(
        handler.seen(),
        vec!["companies.company.registered", "companies.company.renamed"]
    );
    assert!(store.pending_outbox(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_write_commits_nothing_and_dispatches_nothing() {
    let store = FlakyStore::failing_writes_of("companies.user");
    let (uow, handler, _) = setup(store.clone());
    let ctx = CancellationToken::new();

    let company = acme();
    let user = admin_of(&company);

    uow.begin_transaction(&ctx).await.unwrap();
    let result = async {
        uow.repository::<Company>().create(company).await?;
        uow.repository::<User>().create(user).await?;
        uow.commit(&ctx).await
    }
    .await;
    if uow.has_active_transaction().await {
        uow.rollback(&ctx).await.unwrap();
    }

    match result {
        Err(UnitOfWorkError::Store(StoreError::Backend(_))) => {}
        other => panic!("Expected injected store failure, got {other:?}"),
    }
    assert!(handler.seen().is_empty());
    assert_eq!(store.inner.row_count("companies.company").unwrap(), 0);
    assert_eq!(store.inner.row_count("companies.user").unwrap(), 0);
    assert!(store.pending_outbox(10).await.unwrap().is_empty());

    // The unit of work is usable again after the rollback.
    let companies = uow.repository::<Company>();
    assert!(!companies.exists(&Specification::any(), &ctx).await.unwrap());
}

#[tokio::test]
async fn rollback_discards_staged_and_flushed_changes() {
    let store = InMemoryStore::new();
    let (uow, handler, _) = setup(store.clone());
    let ctx = CancellationToken::new();
    let companies = uow.repository::<Company>();

    uow.begin_transaction(&ctx).await.unwrap();
    companies.create(acme()).await.unwrap();
    uow.save_changes(&ctx).await.unwrap();
    companies
        .create(Company::register(EntityId::new(), "Globex", "1", Utc::now()).unwrap())
        .await
        .unwrap();
    uow.rollback(&ctx).await.unwrap();

    assert_eq!(store.row_count("companies.company").unwrap(), 0);
    assert!(handler.seen().is_empty());

    // Nothing staged before the rollback leaks into the next transaction.
    uow.begin_transaction(&ctx).await.unwrap();
    uow.commit(&ctx).await.unwrap();
    assert_eq!(store.row_count("companies.company").unwrap(), 0);
    assert!(handler.seen().is_empty());
}

#[tokio::test]
async fn name_and_tax_id_specification_finds_exactly_one() {
    let store = InMemoryStore::new();
    let (uow, _, _) = setup(store);
    let ctx = CancellationToken::new();
    let companies = uow.repository::<Company>();

    let target = acme();
    for company in [
        target.clone(),
        Company::register(EntityId::new(), "Acme", "99999999000199", Utc::now()).unwrap(),
        Company::register(EntityId::new(), "Globex", "12345678000190", Utc::now()).unwrap(),
    ] {
        companies.create(company).await.unwrap();
    }
    uow.save_changes(&ctx).await.unwrap();

    let spec = specs::has_name("Acme").and(&specs::has_tax_id("12345678000190"));
    let found = companies.query(&spec, &ctx).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), target.id());
}

#[tokio::test]
async fn concurrent_update_conflict_keeps_the_winning_write() {
    let store = InMemoryStore::new();
    let ctx = CancellationToken::new();
    let company = acme();
    let id = company.id();

    let (seed, _, _) = setup(store.clone());
    seed.repository::<Company>().create(company).await.unwrap();
    seed.save_changes(&ctx).await.unwrap();

    let by_id = Specification::<Company>::new(move |c| c.field("id").equals(id));
    let (first, _, _) = setup(store.clone());
    let (second, _, _) = setup(store.clone());
    let mut first_copy = first.repository::<Company>().find_one(&by_id, &ctx).await.unwrap().unwrap();
    let mut second_copy = second.repository::<Company>().find_one(&by_id, &ctx).await.unwrap().unwrap();
    assert_eq!(first_copy.version(), VersionToken::INITIAL);

    first_copy.rename("Acme v2", Utc::now()).unwrap();
    first.repository::<Company>().update(first_copy).await.unwrap();
    first.save_changes(&ctx).await.unwrap();

    second_copy.rename("Acme stale", Utc::now()).unwrap();
    second.repository::<Company>().update(second_copy).await.unwrap();
    let err = second.save_changes(&ctx).await.unwrap_err();
    assert!(err.is_conflict(), "Expected Conflict, got {err:?}");

    let stored = first.repository::<Company>().find_one(&by_id, &ctx).await.unwrap().unwrap();
    assert_eq!(stored.name(), "Acme v2");
    assert_eq!(stored.version(), VersionToken::INITIAL.next());
}

#[tokio::test]
async fn dispatch_failure_keeps_events_pending_for_the_relay() {
    let store = InMemoryStore::new();
    let (uow, handler, dispatcher) = setup(store.clone());
    let ctx = CancellationToken::new();

    handler.failing.store(true, Ordering::SeqCst);
    uow.begin_transaction(&ctx).await.unwrap();
    uow.repository::<Company>().create(acme()).await.unwrap();

    match uow.commit(&ctx).await {
        Err(err @ UnitOfWorkError::DispatchFailure { dispatched: 0, .. }) => assert!(err.is_committed()),
        other => panic!("Expected DispatchFailure, got {other:?}"),
    }
    // The data is durable and the transaction is closed.
    assert!(!uow.has_active_transaction().await);
    assert_eq!(store.row_count("companies.company").unwrap(), 1);
    assert_eq!(store.pending_outbox(10).await.unwrap().len(), 1);

    handler.failing.store(false, Ordering::SeqCst);
    let relay = OutboxRelay::new(store.clone(), dispatcher, 10);
    assert_eq!(relay.relay_pending(&ctx).await.unwrap(), 1);

    assert_eq!(handler.seen(), vec!["companies.company.registered"]);
    assert!(store.pending_outbox(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_commit_leaves_nothing_committed() {
    let store = InMemoryStore::new();
    let (uow, handler, _) = setup(store.clone());
    let ctx = CancellationToken::new();

    uow.begin_transaction(&ctx).await.unwrap();
    uow.repository::<Company>().create(acme()).await.unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    match uow.commit(&cancelled).await {
        Err(UnitOfWorkError::Cancelled) => {}
        other => panic!("Expected Cancelled, got {other:?}"),
    }
    assert!(uow.has_active_transaction().await);
    uow.rollback(&ctx).await.unwrap();

    assert_eq!(store.row_count("companies.company").unwrap(), 0);
    assert!(handler.seen().is_empty());
}

#[tokio::test]
async fn failed_implicit_save_can_be_retried() {
    let store = FlakyStore::default();
    let (uow, handler, _) = setup(store.clone());
    let ctx = CancellationToken::new();

    uow.repository::<Company>().create(acme()).await.unwrap();

    store.fail_next_commit.store(true, Ordering::SeqCst);
    assert!(uow.save_changes(&ctx).await.is_err());
    assert_eq!(store.inner.row_count("companies.company").unwrap(), 0);
    assert!(handler.seen().is_empty());

    assert_eq!(uow.save_changes(&ctx).await.unwrap(), 1);
    assert_eq!(store.inner.row_count("companies.company").unwrap(), 1);
    assert_eq!(handler.seen(), vec!["companies.company.registered"]);
}

#[tokio::test]
async fn removed_company_disappears_from_default_queries() {
    let store = InMemoryStore::new();
    let (uow, handler, _) = setup(store);
    let ctx = CancellationToken::new();
    let companies = uow.repository::<Company>();

    companies.create(acme()).await.unwrap();
    uow.save_changes(&ctx).await.unwrap();

    let mut loaded = companies.find_one(&specs::has_name("Acme"), &ctx).await.unwrap().unwrap();
    loaded.remove(Utc::now()).unwrap();
    companies.delete(loaded).await.unwrap();
    uow.save_changes(&ctx).await.unwrap();

    assert!(!companies.exists(&specs::has_name("Acme"), &ctx).await.unwrap());
    assert_eq!(
        companies.query_including_deleted(&specs::has_name("Acme"), &ctx).await.unwrap().len(),
        1
    );
    assert_eq!(
        handler.seen(),
        vec!["companies.company.registered", "companies.company.deleted"]
    );
}

#[tokio::test]
#[should_panic(expected = "begin_transaction called over failed transaction")]
async fn begin_over_failed_transaction_panics() {
    let store = FlakyStore::failing_writes_of("companies.company");
    let (uow, _, _) = setup(store);
    let ctx = CancellationToken::new();

    uow.begin_transaction(&ctx).await.unwrap();
    uow.repository::<Company>().create(acme()).await.unwrap();
    let _ = uow.save_changes(&ctx).await;

    uow.begin_transaction(&ctx).await.unwrap();
}
