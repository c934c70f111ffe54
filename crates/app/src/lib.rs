//! Application layer: company use cases and event subscribers.

pub mod errors;
pub mod services;
pub mod welcome;

use std::sync::Arc;

use bizhub_events::InMemoryEventDispatcher;

pub use errors::AppError;
pub use services::{CompanyService, RegisterCompany, RegisteredCompany};
pub use welcome::{Email, EmailError, EmailSender, LoggingEmailSender, WelcomeEmailHandler};

/// Dispatcher with every application subscriber registered.
pub fn build_dispatcher(email: Arc<dyn EmailSender>) -> Arc<InMemoryEventDispatcher> {
    let dispatcher = InMemoryEventDispatcher::new();
    dispatcher.subscribe(Arc::new(WelcomeEmailHandler::new(email)));
    Arc::new(dispatcher)
}
