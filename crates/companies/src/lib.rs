//! Companies domain module (companies and their users).
//!
//! This crate contains business rules for companies and users, implemented purely
//! as deterministic domain logic (no IO, no storage). Persistence goes through the
//! unit of work in `bizhub-infra`; queries are expressed as specifications from
//! [`specs`].

pub mod company;
pub mod specs;
pub mod user;

pub use company::{Company, CompanyDeleted, CompanyEvent, CompanyRegistered, CompanyRenamed};
pub use user::{User, UserEvent, UserRegistered, UserRole, WelcomeEmailRequested};
