use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bizhub_core::{
    AggregateRoot, DomainError, DomainResult, Entity, EntityId, EntityMetadata, EventQueue,
    FieldValue, Fields,
};
use bizhub_events::Event;

/// Aggregate root: Company.
///
/// Persisted as a flat JSON document: lifecycle stamps sit next to `name` and
/// `tax_id`, so every field a specification can address is a top-level key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    #[serde(flatten)]
    meta: EntityMetadata,
    name: String,
    /// Digits only; see [`Company::normalize_tax_id`].
    tax_id: String,
    #[serde(skip)]
    events: EventQueue<CompanyEvent>,
}

/// Event: CompanyRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRegistered {
    pub company_id: EntityId,
    pub name: String,
    pub tax_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CompanyRenamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRenamed {
    pub company_id: EntityId,
    pub previous_name: String,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CompanyDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyDeleted {
    pub company_id: EntityId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompanyEvent {
    CompanyRegistered(CompanyRegistered),
    CompanyRenamed(CompanyRenamed),
    CompanyDeleted(CompanyDeleted),
}

impl Event for CompanyEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CompanyEvent::CompanyRegistered(_) => "companies.company.registered",
            CompanyEvent::CompanyRenamed(_) => "companies.company.renamed",
            CompanyEvent::CompanyDeleted(_) => "companies.company.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CompanyEvent::CompanyRegistered(e) => e.occurred_at,
            CompanyEvent::CompanyRenamed(e) => e.occurred_at,
            CompanyEvent::CompanyDeleted(e) => e.occurred_at,
        }
    }
}

impl Company {
    /// Named factory: validates inputs and raises `CompanyRegistered`.
    pub fn register(
        id: EntityId,
        name: impl Into<String>,
        tax_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let name = validate_name(name.into())?;
        let tax_id = Self::normalize_tax_id(tax_id)?;

        let mut company = Self {
            meta: EntityMetadata::new(id, occurred_at),
            name: name.clone(),
            tax_id: tax_id.clone(),
            events: EventQueue::new(),
        };
        company.raise_event(CompanyEvent::CompanyRegistered(CompanyRegistered {
            company_id: id,
            name,
            tax_id,
            occurred_at,
        }));
        Ok(company)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tax_id(&self) -> &str {
        &self.tax_id
    }

    /// Strip formatting punctuation from a tax id, keeping its digits.
    ///
    /// Only `.`, `-`, `/` and spaces are accepted as formatting; checksum rules are
    /// not verified here.
    pub fn normalize_tax_id(raw: &str) -> DomainResult<String> {
        let mut digits = String::with_capacity(raw.len());
        for c in raw.chars() {
            match c {
                '0'..='9' => digits.push(c),
                '.' | '-' | '/' | ' ' => {}
                other => {
                    return Err(DomainError::validation(format!(
                        "tax id contains invalid character {other:?}"
                    )));
                }
            }
        }
        if digits.is_empty() {
            return Err(DomainError::validation("tax id cannot be empty"));
        }
        Ok(digits)
    }

    /// Rename the company. Renaming to the current name is a no-op.
    pub fn rename(&mut self, name: impl Into<String>, occurred_at: DateTime<Utc>) -> DomainResult<()> {
        let name = validate_name(name.into())?;
        if name == self.name {
            return Ok(());
        }
        self.meta.touch(occurred_at)?;

        let previous_name = std::mem::replace(&mut self.name, name.clone());
        self.raise_event(CompanyEvent::CompanyRenamed(CompanyRenamed {
            company_id: self.id(),
            previous_name,
            name,
            occurred_at,
        }));
        Ok(())
    }

    /// Soft delete.
    pub fn remove(&mut self, occurred_at: DateTime<Utc>) -> DomainResult<()> {
        self.meta.mark_deleted(occurred_at)?;
        self.raise_event(CompanyEvent::CompanyDeleted(CompanyDeleted {
            company_id: self.id(),
            occurred_at,
        }));
        Ok(())
    }
}

fn validate_name(name: String) -> DomainResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("name cannot be empty"));
    }
    Ok(trimmed.to_string())
}

impl Entity for Company {
    fn metadata(&self) -> &EntityMetadata {
        &self.meta
    }

    fn metadata_mut(&mut self) -> &mut EntityMetadata {
        &mut self.meta
    }
}

impl AggregateRoot for Company {
    const AGGREGATE_TYPE: &'static str = "companies.company";

    type Event = CompanyEvent;

    fn event_queue(&self) -> &EventQueue<CompanyEvent> {
        &self.events
    }

    fn event_queue_mut(&mut self) -> &mut EventQueue<CompanyEvent> {
        &mut self.events
    }
}

impl Fields for Company {
    fn field(&self, name: &str) -> FieldValue {
        match name {
            "name" => FieldValue::from(&self.name),
            "tax_id" => FieldValue::from(&self.tax_id),
            other => self.meta.field(other).unwrap_or_default(),
        }
    }
}
