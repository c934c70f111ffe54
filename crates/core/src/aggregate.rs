//! Aggregate roots and their pending domain events.

use crate::entity::Entity;

/// Append-only queue of domain events raised by one aggregate instance.
///
/// The queue is plain owned state: events stay here until the unit of work has
/// confirmed the persistence write, then ownership moves out through
/// [`EventQueue::drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQueue<E> {
    pending: Vec<E>,
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: E) {
        self.pending.push(event);
    }

    pub fn as_slice(&self) -> &[E] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every pending event, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<E> {
        std::mem::take(&mut self.pending)
    }

}

impl<E: PartialEq> EventQueue<E> {
    /// Put earlier, still-undelivered events in front of the current ones.
    ///
    /// A copy cloned from the earlier instance already starts with some or all of
    /// those events; only the part it does not carry is prepended, so no event is
    /// queued twice.
    pub fn prepend(&mut self, mut earlier: Vec<E>) {
        let overlap = (0..=earlier.len().min(self.pending.len()))
            .rev()
            .find(|&k| earlier[earlier.len() - k..] == self.pending[..k])
            .unwrap_or(0);
        earlier.truncate(earlier.len() - overlap);
        earlier.append(&mut self.pending);
        self.pending = earlier;
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
        }
    }
}

/// Aggregate root: the only kind of entity allowed to raise domain events.
///
/// Implementations own an [`EventQueue`] and expose it through
/// `event_queue`/`event_queue_mut`; everything else is provided.
pub trait AggregateRoot: Entity {
    /// Stable aggregate type identifier (e.g. "companies.company").
    const AGGREGATE_TYPE: &'static str;

    type Event: Clone + PartialEq + core::fmt::Debug + Send + Sync + 'static;

    fn event_queue(&self) -> &EventQueue<Self::Event>;

    fn event_queue_mut(&mut self) -> &mut EventQueue<Self::Event>;

    fn raise_event(&mut self, event: Self::Event) {
        self.event_queue_mut().push(event);
    }

    /// Pending events, oldest first.
    fn events(&self) -> &[Self::Event] {
        self.event_queue().as_slice()
    }

    /// Remove and return every pending event.
    fn clear_events(&mut self) -> Vec<Self::Event> {
        self.event_queue_mut().drain()
    }
}
