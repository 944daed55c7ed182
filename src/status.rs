//! Consumer-facing surface: a status snapshot plus an event fan-out.
//!
//! The snapshot is a `watch` channel, so late readers always see the latest
//! [`Status`] and never a backlog. Events go through a `broadcast` channel;
//! a subscriber that falls more than `capacity` events behind receives
//! `RecvError::Lagged` and skips ahead.

use tokio::sync::{broadcast, watch};

use crate::types::{BitalinoEvent, Status};

pub struct StatusSurface {
    status: watch::Sender<Status>,
    events: broadcast::Sender<BitalinoEvent>,
}

impl StatusSurface {
    pub fn new(capacity: usize) -> Self {
        let (status, _) = watch::channel(Status::default());
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { status, events }
    }

    /// Replace the snapshot. Works with zero readers.
    pub fn publish(&self, status: Status) {
        self.status.send_replace(status);
    }

    /// Fan out an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: BitalinoEvent) {
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BitalinoEvent> {
        self.events.subscribe()
    }
}
