//! Postgres-backed document store.
//!
//! Aggregates are stored as JSONB documents in a single `entities` table keyed by
//! `(kind, id)`; committed domain events go to the `outbox` table in the same
//! transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Insert of an id that already exists |
//! | Database (other) | Any other | `Backend` | Constraint, syntax or aborted-transaction errors |
//! | PoolClosed | N/A | `Backend` | Connection pool was closed |
//! | Other | N/A | `Backend` | Network errors, connection failures, etc. |
//!
//! A version-token mismatch on update is detected from the affected row count
//! and reported as `Conflict`; an update of a missing row as `NotFound`.

use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{Span, instrument};
use uuid::Uuid;

use bizhub_core::specification::FieldValue;
use bizhub_core::{ExpectedVersion, Specification, VersionToken};
use bizhub_events::JsonEnvelope;

use super::r#trait::{
    OutboxStore, Persistable, RowWrite, SelectOptions, StoreError, StoreTransaction,
    TransactionalStore, Visibility,
};
use super::sql_filter::{SqlFilter, SqlFilterTranslator};
use crate::config::StoreConfig;

/// Tables used by [`PostgresStore`]. Applied by [`PostgresStore::ensure_schema`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        kind     TEXT        NOT NULL,
        id       UUID        NOT NULL,
        version  BIGINT      NOT NULL CHECK (version > 0),
        deleted  BOOLEAN     NOT NULL DEFAULT FALSE,
        data     JSONB       NOT NULL,
        seq      BIGSERIAL   NOT NULL,
        PRIMARY KEY (kind, id)
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS entities_kind_seq_idx ON entities (kind, seq)"#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        event_id      UUID        PRIMARY KEY,
        position      BIGSERIAL   NOT NULL,
        envelope      JSONB       NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        delivered_at  TIMESTAMPTZ NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS outbox_pending_idx ON outbox (position) WHERE delivered_at IS NULL"#,
];

/// Placeholders `$1` (kind) and `$2` (include deleted) precede the filter.
const FILTER_FIRST_PLACEHOLDER: usize = 3;

/// Postgres-backed transactional document store.
///
/// Uses the SQLx connection pool, which is `Send + Sync` and can be shared across
/// tasks. Each [`TransactionalStore::begin`] checks out one connection for the
/// lifetime of the transaction.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Build a pool from configuration.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Backend("DATABASE_URL is not configured".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TransactionalStore for PostgresStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTransaction { tx })
    }
}

#[async_trait::async_trait]
impl OutboxStore for PostgresStore {
    #[instrument(skip(self), err)]
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<JsonEnvelope>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT envelope
            FROM outbox
            WHERE delivered_at IS NULL
            ORDER BY position ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_outbox", e))?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row
                .try_get("envelope")
                .map_err(|e| map_sqlx_error("pending_outbox", e))?;
            envelopes.push(serde_json::from_value(value)?);
        }
        Ok(envelopes)
    }

    #[instrument(skip(self, event_ids), fields(count = event_ids.len()), err)]
    async fn mark_delivered(&self, event_ids: &[Uuid]) -> Result<(), StoreError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE outbox
            SET delivered_at = NOW()
            WHERE event_id = ANY($1) AND delivered_at IS NULL
            "#,
        )
        .bind(event_ids)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_delivered", e))?;
        Ok(())
    }
}

/// Transaction over [`PostgresStore`]. Dropping it without commit rolls back.
#[derive(Debug)]
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl StoreTransaction for PostgresTransaction {
    #[instrument(
        skip(self, row),
        fields(kind = row.kind, id = %row.id, expected = ?row.expected),
        err
    )]
    async fn write(&mut self, row: RowWrite) -> Result<VersionToken, StoreError> {
        match row.expected {
            ExpectedVersion::Absent => {
                sqlx::query(
                    r#"
                    INSERT INTO entities (kind, id, version, deleted, data)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(row.kind)
                .bind(row.id.as_uuid())
                .bind(VersionToken::INITIAL.raw() as i64)
                .bind(row.deleted)
                .bind(&row.document)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StoreError::Conflict(format!("{} {} already exists", row.kind, row.id))
                    } else {
                        map_sqlx_error("insert_entity", e)
                    }
                })?;
                Ok(VersionToken::INITIAL)
            }
            ExpectedVersion::Exact(expected) => {
                let updated = sqlx::query(
                    r#"
                    UPDATE entities
                    SET version = version + 1, deleted = $3, data = $4
                    WHERE kind = $1 AND id = $2 AND version = $5
                    RETURNING version
                    "#,
                )
                .bind(row.kind)
                .bind(row.id.as_uuid())
                .bind(row.deleted)
                .bind(&row.document)
                .bind(expected.raw() as i64)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("update_entity", e))?;

                if let Some(updated) = updated {
                    let version: i64 = updated
                        .try_get("version")
                        .map_err(|e| map_sqlx_error("update_entity", e))?;
                    return Ok(VersionToken::from_raw(version as u64));
                }

                // Zero rows: tell a stale token from a missing row.
                let current = sqlx::query("SELECT version FROM entities WHERE kind = $1 AND id = $2")
                    .bind(row.kind)
                    .bind(row.id.as_uuid())
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(|e| map_sqlx_error("check_version", e))?;

                match current {
                    None => Err(StoreError::NotFound(format!("{} {}", row.kind, row.id))),
                    Some(current) => {
                        let version: i64 = current
                            .try_get("version")
                            .map_err(|e| map_sqlx_error("check_version", e))?;
                        Err(StoreError::Conflict(format!(
                            "{} {} is at v{}, write expected {}",
                            row.kind, row.id, version, expected
                        )))
                    }
                }
            }
        }
    }

    #[instrument(
        skip(self, spec),
        fields(kind = T::AGGREGATE_TYPE, visibility = ?options.visibility, returned),
        err
    )]
    async fn select<T: Persistable>(
        &mut self,
        spec: &Specification<T>,
        options: SelectOptions,
    ) -> Result<Vec<T>, StoreError> {
        let filter: SqlFilter = spec.to_filter(&SqlFilterTranslator::new("data", FILTER_FIRST_PLACEHOLDER))?;

        let mut sql = format!(
            "SELECT version, data FROM entities WHERE kind = $1 AND ($2 OR NOT deleted) AND {} ORDER BY seq ASC",
            filter.sql
        );
        if let Some(limit) = options.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql)
            .bind(T::AGGREGATE_TYPE)
            .bind(options.visibility == Visibility::IncludeDeleted);
        for value in &filter.params {
            query = bind_value(query, value);
        }

        let rows = query
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("select_entities", e))?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            entities.push(decode_entity::<T>(&row)?);
        }

        Span::current().record("returned", entities.len());
        Ok(entities)
    }

    #[instrument(skip(self, records), fields(count = records.len()), err)]
    async fn enqueue_outbox(&mut self, records: Vec<JsonEnvelope>) -> Result<(), StoreError> {
        for envelope in records {
            sqlx::query("INSERT INTO outbox (event_id, envelope) VALUES ($1, $2)")
                .bind(envelope.event_id())
                .bind(serde_json::to_value(&envelope)?)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("enqueue_outbox", e))?;
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &FieldValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        FieldValue::Null => query.bind(None::<String>),
        FieldValue::Bool(b) => query.bind(*b),
        FieldValue::Int(i) => query.bind(*i),
        FieldValue::Text(s) => query.bind(s.clone()),
        FieldValue::Uuid(u) => query.bind(*u),
        FieldValue::Timestamp(t) => query.bind(*t),
    }
}

fn decode_entity<T: Persistable>(row: &PgRow) -> Result<T, StoreError> {
    let version: i64 = row
        .try_get("version")
        .map_err(|e| map_sqlx_error("decode_entity", e))?;
    let data: serde_json::Value = row
        .try_get("data")
        .map_err(|e| map_sqlx_error("decode_entity", e))?;

    let mut entity: T = serde_json::from_value(data)?;
    entity.metadata_mut().assign_version(VersionToken::from_raw(version as u64));
    Ok(entity)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}
