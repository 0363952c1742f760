//! Per-request event bus.
//!
//! Broadcast with bounded per-listener queues; publishing blocks when a
//! listener's queue is full, so a slow client paces the producer instead
//! of losing events.

use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender};

use plakar_types::{Event, EventSink};

const LISTENER_QUEUE: usize = 256;

pub struct EventBus {
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = bounded(LISTENER_QUEUE);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Drop every subscriber, closing their channels.
    pub fn close(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        // drop listeners that went away, pace on the ones that remain
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_reach_every_listener() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.emit(Event::PathRestored {
            path: "/x".to_string(),
        });
        assert!(matches!(a.try_recv(), Ok(Event::PathRestored { .. })));
        assert!(matches!(b.try_recv(), Ok(Event::PathRestored { .. })));
    }

    #[test]
    fn dead_listeners_are_dropped() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit(Event::PathRestored {
            path: "/x".to_string(),
        });
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
