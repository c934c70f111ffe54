//! Transactional outbox delivery.
//!
//! A unit of work writes one outbox record per collected event in the same store
//! transaction as the entity rows, so a committed write always has its events on
//! record. Delivery happens afterwards:
//!
//! 1. right after the commit, by the unit of work itself ([`deliver`]);
//! 2. for anything that failed or was interrupted, by [`OutboxRelay`], which
//!    polls pending records and redelivers them in order.
//!
//! Delivery is at-least-once. A record is marked delivered only after every
//! subscriber accepted it; a crash between dispatch and marking redelivers it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use bizhub_events::{DispatchError, EventDispatcher, JsonEnvelope};

use crate::config::StoreConfig;
use crate::store::{OutboxStore, StoreError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("outbox store error: {0}")]
    Store(#[from] StoreError),

    /// Delivery stopped at the first failing record; `delivered` records before it went out.
    #[error("outbox delivery failed after {delivered} record(s): {source}")]
    Dispatch {
        delivered: usize,
        #[source]
        source: DispatchError,
    },
}

/// Dispatch `envelopes` one at a time, in order, marking each delivered.
///
/// Stops at the first subscriber failure and returns the number of envelopes
/// delivered before it together with the error. A failure to mark a record is
/// logged and otherwise ignored: the record stays pending and is redelivered.
pub(crate) async fn deliver<O>(
    dispatcher: &dyn EventDispatcher,
    outbox: &O,
    envelopes: &[JsonEnvelope],
) -> Result<usize, (usize, DispatchError)>
where
    O: OutboxStore + ?Sized,
{
    for (delivered, envelope) in envelopes.iter().enumerate() {
        if let Err(source) = dispatcher.dispatch(envelope).await {
            warn!(
                event_id = %envelope.event_id(),
                event_type = envelope.event_type(),
                delivered,
                error = %source,
                "event dispatch failed; record stays pending in the outbox"
            );
            return Err((delivered, source));
        }

        if let Err(err) = outbox.mark_delivered(&[envelope.event_id()]).await {
            warn!(
                event_id = %envelope.event_id(),
                error = %err,
                "failed to mark outbox record delivered; it will be redelivered"
            );
        }
    }
    Ok(envelopes.len())
}

/// Redelivers pending outbox records.
pub struct OutboxRelay<S> {
    store: S,
    dispatcher: Arc<dyn EventDispatcher>,
    batch_size: usize,
}

impl<S> OutboxRelay<S>
where
    S: OutboxStore,
{
    pub fn new(store: S, dispatcher: Arc<dyn EventDispatcher>, batch_size: usize) -> Self {
        Self {
            store,
            dispatcher,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(store: S, dispatcher: Arc<dyn EventDispatcher>, config: &StoreConfig) -> Self {
        Self::new(store, dispatcher, config.outbox_batch_size)
    }

    /// Deliver one batch of pending records, oldest first.
    ///
    /// Returns how many were delivered. Cancellation is checked between records;
    /// a record whose dispatch already started is finished first.
    #[instrument(skip(self, ctx), fields(batch_size = self.batch_size), err)]
    pub async fn relay_pending(&self, ctx: &CancellationToken) -> Result<usize, RelayError> {
        let pending = self.store.pending_outbox(self.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(pending = pending.len(), "relaying outbox records");

        let mut delivered = 0;
        for envelope in &pending {
            if ctx.is_cancelled() {
                break;
            }
            let sent = deliver(&*self.dispatcher, &self.store, std::slice::from_ref(envelope))
                .await
                .map_err(|(_, source)| RelayError::Dispatch { delivered, source })?;
            delivered += sent;
        }
        Ok(delivered)
    }

    /// Poll until `ctx` is cancelled.
    ///
    /// Batch failures are logged and retried on the next tick.
    pub async fn run(&self, ctx: &CancellationToken, interval: Duration) {
        info!(interval_ms = interval.as_millis() as u64, "outbox relay started");
        loop {
            if ctx.is_cancelled() {
                break;
            }

            match self.relay_pending(ctx).await {
                Ok(0) => {}
                Ok(delivered) => info!(delivered, "outbox records delivered"),
                Err(err) => warn!(error = %err, "outbox relay batch failed"),
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("outbox relay stopped");
    }
}

impl<S> core::fmt::Debug for OutboxRelay<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}
