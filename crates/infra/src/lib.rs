//! Infrastructure layer: storage adapters, the unit of work, outbox delivery, config.

pub mod config;
pub mod outbox;
pub mod store;
pub mod unit_of_work;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, StoreConfig};
pub use outbox::{OutboxRelay, RelayError};
pub use unit_of_work::{Repository, UnitOfWork, UnitOfWorkError};
