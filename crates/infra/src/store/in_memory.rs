use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use uuid::Uuid;

use bizhub_core::{EntityId, ExpectedVersion, Specification, VersionToken};
use bizhub_events::JsonEnvelope;

use super::r#trait::{
    OutboxStore, Persistable, RowWrite, SelectOptions, StoreError, StoreTransaction,
    TransactionalStore, Visibility,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    kind: &'static str,
    id: EntityId,
}

#[derive(Debug, Clone)]
struct Row {
    version: VersionToken,
    deleted: bool,
    document: JsonValue,
    /// Insertion position; reads are returned in this order.
    seq: u64,
}

#[derive(Debug, Clone)]
struct OutboxEntry {
    envelope: JsonEnvelope,
    delivered: bool,
}

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<RowKey, Row>,
    outbox: Vec<OutboxEntry>,
    next_seq: u64,
}

/// In-memory document store with optimistic transactions.
///
/// Intended for tests/dev. Not optimized for performance.
///
/// A transaction buffers its writes and validates them again at commit: if any
/// row it touched was changed by another transaction in the meantime, the
/// commit fails with a conflict and nothing is applied.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows of `kind`, soft-deleted ones included.
    pub fn row_count(&self, kind: &str) -> Result<usize, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.rows.keys().filter(|k| k.kind == kind).count())
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl TransactionalStore for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, StoreError> {
        Ok(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            staged: HashMap::new(),
            read_versions: HashMap::new(),
            outbox: Vec::new(),
        })
    }
}

#[async_trait::async_trait]
impl OutboxStore for InMemoryStore {
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<JsonEnvelope>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| !e.delivered)
            .take(limit)
            .map(|e| e.envelope.clone())
            .collect())
    }

    async fn mark_delivered(&self, event_ids: &[Uuid]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        for entry in tables.outbox.iter_mut() {
            if event_ids.contains(&entry.envelope.event_id()) {
                entry.delivered = true;
            }
        }
        Ok(())
    }
}

/// Transaction over [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    staged: HashMap<RowKey, Row>,
    /// Committed version of each touched row at first touch (`None`: absent).
    read_versions: HashMap<RowKey, Option<VersionToken>>,
    outbox: Vec<JsonEnvelope>,
}

impl InMemoryTransaction {
    fn current(&self, tables: &Tables, key: &RowKey) -> Option<Row> {
        self.staged
            .get(key)
            .or_else(|| tables.rows.get(key))
            .cloned()
    }
}

#[async_trait::async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn write(&mut self, row: RowWrite) -> Result<VersionToken, StoreError> {
        let key = RowKey {
            kind: row.kind,
            id: row.id,
        };

        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let current = self.current(&tables, &key);

        let (version, seq) = match (row.expected, &current) {
            (ExpectedVersion::Absent, None) => {
                let seq = tables.next_seq;
                tables.next_seq += 1;
                (VersionToken::INITIAL, seq)
            }
            (ExpectedVersion::Absent, Some(_)) => {
                return Err(StoreError::Conflict(format!("{} {} already exists", row.kind, row.id)));
            }
            (ExpectedVersion::Exact(_), None) => {
                return Err(StoreError::NotFound(format!("{} {}", row.kind, row.id)));
            }
            (ExpectedVersion::Exact(expected), Some(existing)) => {
                if existing.version != expected {
                    return Err(StoreError::Conflict(format!(
                        "{} {} is at {}, write expected {}",
                        row.kind, row.id, existing.version, expected
                    )));
                }
                (existing.version.next(), existing.seq)
            }
        };

        let committed = tables.rows.get(&key).map(|r| r.version);
        drop(tables);

        self.read_versions.entry(key).or_insert(committed);
        self.staged.insert(
            key,
            Row {
                version,
                deleted: row.deleted,
                document: row.document,
                seq,
            },
        );
        Ok(version)
    }

    async fn select<T: Persistable>(
        &mut self,
        spec: &Specification<T>,
        options: SelectOptions,
    ) -> Result<Vec<T>, StoreError> {
        let rows: Vec<Row> = {
            let tables = self.tables.read().map_err(|_| poisoned())?;
            let mut merged: HashMap<RowKey, &Row> = tables
                .rows
                .iter()
                .filter(|(k, _)| k.kind == T::AGGREGATE_TYPE)
                .map(|(k, r)| (*k, r))
                .collect();
            for (k, r) in self.staged.iter().filter(|(k, _)| k.kind == T::AGGREGATE_TYPE) {
                merged.insert(*k, r);
            }
            let mut rows: Vec<Row> = merged
                .into_values()
                .filter(|r| options.visibility == Visibility::IncludeDeleted || !r.deleted)
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.seq);
            rows
        };

        let mut matched = Vec::new();
        for row in rows {
            if options.limit.is_some_and(|limit| matched.len() >= limit) {
                break;
            }
            let mut entity: T = serde_json::from_value(row.document)?;
            entity.metadata_mut().assign_version(row.version);
            if spec.is_satisfied_by(&entity) {
                matched.push(entity);
            }
        }
        Ok(matched)
    }

    async fn enqueue_outbox(&mut self, records: Vec<JsonEnvelope>) -> Result<(), StoreError> {
        self.outbox.extend(records);
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;

        for (key, read) in &self.read_versions {
            let now = tables.rows.get(key).map(|r| r.version);
            if now != *read {
                return Err(StoreError::Conflict(format!(
                    "{} {} was changed by a concurrent transaction",
                    key.kind, key.id
                )));
            }
        }

        tables.rows.extend(self.staged);
        tables.outbox.extend(self.outbox.into_iter().map(|envelope| OutboxEntry {
            envelope,
            delivered: false,
        }));
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bizhub_companies::Company;
    use bizhub_core::{AggregateRoot, Entity, TransactionId};
    use bizhub_events::EventEnvelope;
    use chrono::Utc;

    fn write_new(id: EntityId) -> RowWrite {
        RowWrite {
            kind: "test.doc",
            id,
            expected: ExpectedVersion::Absent,
            deleted: false,
            document: serde_json::json!({ "n": 1 }),
        }
    }

    fn company_row(company: &Company, expected: ExpectedVersion) -> RowWrite {
        RowWrite {
            kind: "companies.company",
            id: company.id(),
            expected,
            deleted: false,
            document: serde_json::to_value(company).unwrap(),
        }
    }

    #[tokio::test]
    async fn insert_then_update_bumps_version() {
        let store = InMemoryStore::new();
        let id = EntityId::new();

        let mut tx = store.begin().await.unwrap();
        let v1 = tx.write(write_new(id)).await.unwrap();
        assert_eq!(v1, VersionToken::INITIAL);

        let mut update = write_new(id);
        update.expected = ExpectedVersion::Exact(v1);
        let v2 = tx.write(update).await.unwrap();
        assert_eq!(v2, v1.next());
        tx.commit().await.unwrap();

        assert_eq!(store.row_count("test.doc").unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_and_stale_update_conflict() {
        let store = InMemoryStore::new();
        let id = EntityId::new();

        let mut tx = store.begin().await.unwrap();
        tx.write(write_new(id)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        match tx.write(write_new(id)).await {
            Err(StoreError::Conflict(_)) => {}
            other => panic!("Expected Conflict for duplicate insert, got {other:?}"),
        }

        let mut stale = write_new(id);
        stale.expected = ExpectedVersion::Exact(VersionToken::from_raw(7));
        match tx.write(stale).await {
            Err(StoreError::Conflict(_)) => {}
            other => panic!("Expected Conflict for stale token, got {other:?}"),
        }

        let mut missing = write_new(EntityId::new());
        missing.expected = ExpectedVersion::Exact(VersionToken::INITIAL);
        match tx.write(missing).await {
            Err(StoreError::NotFound(_)) => {}
            other => panic!("Expected NotFound for missing row, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_to_other_transactions() {
        let store = InMemoryStore::new();
        let company = Company::register(EntityId::new(), "Acme", "1", Utc::now()).unwrap();

        let mut writer = store.begin().await.unwrap();
        writer.write(company_row(&company, ExpectedVersion::Absent)).await.unwrap();

        let own = writer.select(&Specification::<Company>::any(), SelectOptions::live()).await.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].version(), VersionToken::INITIAL);

        let mut reader = store.begin().await.unwrap();
        let seen = reader.select(&Specification::<Company>::any(), SelectOptions::live()).await.unwrap();
        assert!(seen.is_empty());

        writer.rollback().await.unwrap();
        assert_eq!(store.row_count("companies.company").unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_detects_concurrent_change() {
        let store = InMemoryStore::new();
        let company = Company::register(EntityId::new(), "Acme", "1", Utc::now()).unwrap();

        let mut setup = store.begin().await.unwrap();
        setup.write(company_row(&company, ExpectedVersion::Absent)).await.unwrap();
        setup.commit().await.unwrap();

        let exact = ExpectedVersion::Exact(VersionToken::INITIAL);
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.write(company_row(&company, exact)).await.unwrap();
        second.write(company_row(&company, exact)).await.unwrap();

        first.commit().await.unwrap();
        match second.commit().await {
            Err(StoreError::Conflict(_)) => {}
            other => panic!("Expected Conflict at commit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn select_applies_soft_delete_filter_and_limit() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        for name in ["A", "B", "C"] {
            let company = Company::register(EntityId::new(), name, "1", Utc::now()).unwrap();
            let mut row = company_row(&company, ExpectedVersion::Absent);
            row.deleted = name == "B";
            tx.write(row).await.unwrap();
        }

        let all = Specification::<Company>::any();
        let live = tx.select(&all, SelectOptions::live()).await.unwrap();
        let names: Vec<_> = live.iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["A", "C"]);

        let everything = tx.select(&all, SelectOptions::including_deleted()).await.unwrap();
        assert_eq!(everything.len(), 3);

        let first = tx.select(&all, SelectOptions::including_deleted().limit(1)).await.unwrap();
        assert_eq!(first[0].name(), "A");
    }

    #[tokio::test]
    async fn outbox_records_become_pending_only_on_commit() {
        let store = InMemoryStore::new();
        let mut company = Company::register(EntityId::new(), "Acme", "1", Utc::now()).unwrap();
        let events = company.clear_events();
        let envelope = EventEnvelope::wrap(
            TransactionId::new(),
            0,
            company.id(),
            Company::AGGREGATE_TYPE,
            events[0].clone(),
        )
        .to_json()
        .unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.enqueue_outbox(vec![envelope.clone()]).await.unwrap();
        assert!(store.pending_outbox(10).await.unwrap().is_empty());
        tx.commit().await.unwrap();

        let pending = store.pending_outbox(10).await.unwrap();
        assert_eq!(pending, vec![envelope.clone()]);

        store.mark_delivered(&[envelope.event_id()]).await.unwrap();
        assert!(store.pending_outbox(10).await.unwrap().is_empty());
    }
}
