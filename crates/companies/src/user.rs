use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bizhub_core::{
    AggregateRoot, DomainError, DomainResult, Entity, EntityId, EntityMetadata, EventQueue,
    FieldValue, Fields,
};
use bizhub_events::Event;

/// Role of a user within its company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Member,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Member => "member",
        }
    }
}

/// Aggregate root: User (belongs to exactly one company).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(flatten)]
    meta: EntityMetadata,
    company_id: EntityId,
    /// Lowercased.
    email: String,
    display_name: String,
    role: UserRole,
    #[serde(skip)]
    events: EventQueue<UserEvent>,
}

/// Event: UserRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: EntityId,
    pub company_id: EntityId,
    pub email: String,
    pub role: UserRole,
    pub occurred_at: DateTime<Utc>,
}

/// Event: WelcomeEmailRequested.
///
/// Carries everything the mail subscriber needs; it never loads the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeEmailRequested {
    pub user_id: EntityId,
    pub email: String,
    pub display_name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserEvent {
    UserRegistered(UserRegistered),
    WelcomeEmailRequested(WelcomeEmailRequested),
}

impl Event for UserEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UserEvent::UserRegistered(_) => "companies.user.registered",
            UserEvent::WelcomeEmailRequested(_) => "companies.user.welcome_email_requested",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            UserEvent::UserRegistered(e) => e.occurred_at,
            UserEvent::WelcomeEmailRequested(e) => e.occurred_at,
        }
    }
}

impl User {
    /// Named factory: validates inputs and raises `UserRegistered`.
    pub fn register(
        id: EntityId,
        company_id: EntityId,
        email: &str,
        display_name: impl Into<String>,
        role: UserRole,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let email = Self::normalize_email(email)?;
        let display_name = display_name.into().trim().to_string();
        if display_name.is_empty() {
            return Err(DomainError::validation("display name cannot be empty"));
        }

        let mut user = Self {
            meta: EntityMetadata::new(id, occurred_at),
            company_id,
            email: email.clone(),
            display_name,
            role,
            events: EventQueue::new(),
        };
        user.raise_event(UserEvent::UserRegistered(UserRegistered {
            user_id: id,
            company_id,
            email,
            role,
            occurred_at,
        }));
        Ok(user)
    }

    pub fn company_id(&self) -> EntityId {
        self.company_id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn role(&self) -> UserRole {
        self.role
    }

    /// Trim and lowercase; requires a single `@` with text on both sides.
    pub fn normalize_email(raw: &str) -> DomainResult<String> {
        let email = raw.trim().to_lowercase();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
                Ok(email)
            }
            _ => Err(DomainError::validation(format!("invalid email address {raw:?}"))),
        }
    }

    /// Ask for a welcome email to be sent once this user is committed.
    pub fn request_welcome_email(&mut self, occurred_at: DateTime<Utc>) -> DomainResult<()> {
        if self.is_deleted() {
            return Err(DomainError::invariant("cannot welcome a deleted user"));
        }
        self.raise_event(UserEvent::WelcomeEmailRequested(WelcomeEmailRequested {
            user_id: self.id(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            occurred_at,
        }));
        Ok(())
    }
}

impl Entity for User {
    fn metadata(&self) -> &EntityMetadata {
        &self.meta
    }

    fn metadata_mut(&mut self) -> &mut EntityMetadata {
        &mut self.meta
    }
}

impl AggregateRoot for User {
    const AGGREGATE_TYPE: &'static str = "companies.user";

    type Event = UserEvent;

    fn event_queue(&self) -> &EventQueue<UserEvent> {
        &self.events
    }

    fn event_queue_mut(&mut self) -> &mut EventQueue<UserEvent> {
        &mut self.events
    }
}

impl Fields for User {
    fn field(&self, name: &str) -> FieldValue {
        match name {
            "company_id" => FieldValue::from(self.company_id),
            "email" => FieldValue::from(&self.email),
            "display_name" => FieldValue::from(&self.display_name),
            "role" => FieldValue::from(self.role.as_str()),
            other => self.meta.field(other).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> User {
        User::register(
            EntityId::new(),
            EntityId::new(),
            " Ada@Example.COM ",
            "Ada",
            UserRole::Admin,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn register_normalizes_email_and_raises_event() {
        let user = admin();
        assert_eq!(user.email(), "ada@example.com");
        match user.events() {
            [UserEvent::UserRegistered(e)] => {
                assert_eq!(e.user_id, user.id());
                assert_eq!(e.company_id, user.company_id());
                assert_eq!(e.role, UserRole::Admin);
            }
            other => panic!("Expected a single UserRegistered event, got {other:?}"),
        }
    }

    #[test]
    fn register_rejects_invalid_email() {
        for raw in ["", "ada", "@example.com", "ada@", "a@b@c"] {
            match User::register(EntityId::new(), EntityId::new(), raw, "Ada", UserRole::Member, Utc::now()) {
                Err(DomainError::Validation(_)) => {}
                other => panic!("Expected Validation error for {raw:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn welcome_email_request_follows_registration() {
        let mut user = admin();
        user.request_welcome_email(Utc::now()).unwrap();

        let types: Vec<_> = user.events().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec!["companies.user.registered", "companies.user.welcome_email_requested"]
        );
    }

    #[test]
    fn role_serializes_lowercase_and_matches_field_value() {
        let user = admin();
        let doc = serde_json::to_value(&user).unwrap();
        assert_eq!(doc["role"], "admin");
        assert_eq!(user.field("role"), FieldValue::from("admin"));
    }
}
