//! `bizhub-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, entity lifecycle metadata, aggregate
//! roots with their pending event queues, optimistic concurrency tokens, and the
//! specification (predicate composition) engine.

pub mod aggregate;
pub mod concurrency;
pub mod entity;
pub mod error;
pub mod id;
pub mod specification;

pub use aggregate::{AggregateRoot, EventQueue};
pub use concurrency::{ExpectedVersion, VersionToken};
pub use entity::{Entity, EntityMetadata};
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, TransactionId};
pub use specification::{FieldValue, Fields, FilterTranslator, Predicate, Specification};
