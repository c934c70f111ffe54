//! Welcome email subscriber.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use bizhub_companies::UserEvent;
use bizhub_events::{EventHandler, HandlerError, JsonEnvelope};

const WELCOME_EMAIL_REQUESTED: &str = "companies.user.welcome_email_requested";

/// Handled event ids remembered per handler.
pub const DEFAULT_DEDUPE_WINDOW: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
#[error("email delivery failed: {0}")]
pub struct EmailError(pub String);

/// Outbound email port.
#[async_trait::async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), EmailError>;
}

/// Sender that only logs. Used when no mail transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEmailSender;

#[async_trait::async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send(&self, email: &Email) -> Result<(), EmailError> {
        info!(to = %email.to, subject = %email.subject, "email sent (logging transport)");
        Ok(())
    }
}

/// Bounded set of the most recently handled event ids.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if self.capacity == 0 || !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Sends the welcome email for `WelcomeEmailRequested` events.
///
/// The outbox marks an event delivered once every subscriber accepted it, which
/// is what keeps a relayed event from being sent again. On top of that the
/// handler remembers the last few handled event ids, so a redelivery that races
/// the outbox bookkeeping does not send a second email from the same process.
pub struct WelcomeEmailHandler {
    sender: Arc<dyn EmailSender>,
    sent: Mutex<RecentIds>,
}

impl WelcomeEmailHandler {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self::with_dedupe_window(sender, DEFAULT_DEDUPE_WINDOW)
    }

    pub fn with_dedupe_window(sender: Arc<dyn EmailSender>, window: usize) -> Self {
        Self {
            sender,
            sent: Mutex::new(RecentIds::new(window)),
        }
    }

    fn already_sent(&self, event_id: Uuid) -> bool {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).contains(&event_id)
    }

    fn remember(&self, event_id: Uuid) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).insert(event_id);
    }
}

impl core::fmt::Debug for WelcomeEmailHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WelcomeEmailHandler").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl EventHandler for WelcomeEmailHandler {
    fn name(&self) -> &'static str {
        "welcome_email"
    }

    async fn handle(&self, envelope: &JsonEnvelope) -> Result<(), HandlerError> {
        if envelope.event_type() != WELCOME_EMAIL_REQUESTED || self.already_sent(envelope.event_id()) {
            return Ok(());
        }

        let UserEvent::WelcomeEmailRequested(requested) = envelope.decode::<UserEvent>()? else {
            return Err(HandlerError::failed(format!(
                "event {} is tagged {WELCOME_EMAIL_REQUESTED} but carries another payload",
                envelope.event_id()
            )));
        };

        let email = Email {
            to: requested.email,
            subject: "Welcome to bizhub".to_string(),
            body: format!("Hi {}, your account is ready.", requested.display_name),
        };
        self.sender
            .send(&email)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;

        self.remember(envelope.event_id());
        Ok(())
    }
}
