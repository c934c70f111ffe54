//! Entity trait: identity + continuity across state changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::concurrency::VersionToken;
use crate::error::{DomainError, DomainResult};
use crate::id::EntityId;
use crate::specification::FieldValue;

/// Identity and lifecycle stamps shared by every persisted entity.
///
/// - `id` is fixed at construction and never changes.
/// - `modified_at` is stamped by every named mutation (see [`EntityMetadata::touch`]).
/// - `deleted_at` marks a soft delete: the entity stays stored but is hidden from
///   default reads.
/// - `version` is assigned by the store on every successful write and is not part
///   of the serialized document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    id: EntityId,
    created_at: DateTime<Utc>,
    modified_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    version: VersionToken,
}

impl EntityMetadata {
    pub fn new(id: EntityId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            modified_at: None,
            deleted_at: None,
            version: VersionToken::UNSAVED,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn version(&self) -> VersionToken {
        self.version
    }

    /// Record the token the store assigned on load or after a write.
    ///
    /// Only persistence adapters should call this.
    pub fn assign_version(&mut self, version: VersionToken) {
        self.version = version;
    }

    /// Stamp a modification.
    ///
    /// Mutating a soft-deleted entity is an invariant violation.
    pub fn touch(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.is_deleted() {
            return Err(DomainError::invariant(format!(
                "entity {} is deleted and cannot be modified",
                self.id
            )));
        }
        self.modified_at = Some(at);
        Ok(())
    }

    /// Transition to the soft-deleted state.
    pub fn mark_deleted(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.touch(at)?;
        self.deleted_at = Some(at);
        Ok(())
    }

    /// Lifecycle fields addressable by specifications.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        let value = match name {
            "id" => FieldValue::from(self.id),
            "created_at" => FieldValue::from(self.created_at),
            "modified_at" => self.modified_at.map(FieldValue::from).unwrap_or_default(),
            "deleted_at" => self.deleted_at.map(FieldValue::from).unwrap_or_default(),
            _ => return None,
        };
        Some(value)
    }
}

/// Entity marker + minimal interface.
pub trait Entity {
    fn metadata(&self) -> &EntityMetadata;

    fn metadata_mut(&mut self) -> &mut EntityMetadata;

    /// Returns the entity identifier.
    fn id(&self) -> EntityId {
        self.metadata().id()
    }

    fn version(&self) -> VersionToken {
        self.metadata().version()
    }

    fn is_deleted(&self) -> bool {
        self.metadata().is_deleted()
    }
}
