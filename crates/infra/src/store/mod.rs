//! Storage port and its adapters.
//!
//! The unit of work talks to storage only through [`TransactionalStore`] and
//! [`StoreTransaction`]; [`InMemoryStore`] backs tests and local runs,
//! [`PostgresStore`] production.

pub mod in_memory;
pub mod postgres;
pub mod sql_filter;
pub mod r#trait;

pub use in_memory::{InMemoryStore, InMemoryTransaction};
pub use postgres::{PostgresStore, PostgresTransaction};
pub use sql_filter::{SqlFilter, SqlFilterTranslator, TranslateError};
pub use r#trait::{
    OutboxStore, Persistable, RowWrite, SelectOptions, StoreError, StoreTransaction,
    TransactionalStore, Visibility,
};
