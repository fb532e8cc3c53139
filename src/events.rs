//! In-process publish/subscribe for status deltas.
//!
//! Best-effort fan-out: each subscriber sits behind a bounded broadcast
//! buffer; a lagging subscriber loses its oldest undelivered events and
//! observes a single overflow marker instead. The persisted events table is
//! the authoritative log — observers that must not miss anything read it
//! with a cursor.

use std::collections::HashSet;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Event, EventKind};

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fan an already-committed event out to subscribers. Absence of
    /// subscribers is not an error.
    pub fn publish(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }

    pub fn publish_all(&self, events: &[Event]) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_BUFFER)
    }
}

/// Subscriber-side selection: which kinds and/or which subject to observe.
/// An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: Option<HashSet<EventKind>>,
    pub subject_id: Option<Uuid>,
}

impl EventFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            subject_id: None,
        }
    }

    pub fn subject(subject_id: Uuid) -> Self {
        Self {
            kinds: None,
            subject_id: Some(subject_id),
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(subject_id) = self.subject_id {
            if event.subject_id != subject_id {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub enum BusItem {
    Event(Event),
    /// The subscriber fell behind and `skipped` events were dropped.
    Overflow { skipped: u64 },
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl Subscription {
    /// Next matching event, an overflow marker, or `None` once the bus is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<BusItem> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(BusItem::Event(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(BusItem::Overflow { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubjectKind;
    use chrono::Utc;

    fn event(id: i64, kind: EventKind, subject_id: Uuid) -> Event {
        Event {
            id,
            project_id: Uuid::new_v4(),
            kind,
            subject_kind: SubjectKind::Task,
            subject_id,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_matching_events_in_order() {
        let bus = EventBus::new(8);
        let subject = Uuid::new_v4();
        let mut sub = bus.subscribe(EventFilter::subject(subject));

        bus.publish(&event(1, EventKind::Progress, subject));
        bus.publish(&event(2, EventKind::Progress, Uuid::new_v4()));
        bus.publish(&event(3, EventKind::StatusChange, subject));

        match sub.recv().await {
            Some(BusItem::Event(e)) => assert_eq!(e.id, 1),
            other => panic!("unexpected: {other:?}"),
        }
        match sub.recv().await {
            Some(BusItem::Event(e)) => assert_eq!(e.id, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn kind_filter_drops_other_kinds() {
        let bus = EventBus::new(8);
        let subject = Uuid::new_v4();
        let mut sub = bus.subscribe(EventFilter::kinds([EventKind::Error]));

        bus.publish(&event(1, EventKind::Progress, subject));
        bus.publish(&event(2, EventKind::Error, subject));

        match sub.recv().await {
            Some(BusItem::Event(e)) => assert_eq!(e.id, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_synthesizes_single_marker() {
        let bus = EventBus::new(2);
        let subject = Uuid::new_v4();
        let mut sub = bus.subscribe(EventFilter::default());

        for i in 0..6 {
            bus.publish(&event(i, EventKind::Progress, subject));
        }

        match sub.recv().await {
            Some(BusItem::Overflow { skipped }) => assert_eq!(skipped, 4),
            other => panic!("expected overflow, got {other:?}"),
        }
        // The newest events are still delivered after the marker.
        match sub.recv().await {
            Some(BusItem::Event(e)) => assert_eq!(e.id, 4),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
