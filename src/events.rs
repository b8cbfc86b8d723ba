//! Structured events emitted by the sync tasks.
//!
//! The core never formats text for the user; the presentation task in `main`
//! subscribes to the bus and renders these.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::model::OperationId;

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Applied,
    Failed(String),
}

/// Counters of one reconciliation cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub added: usize,
    pub removed: usize,
    pub moved: usize,
    pub failed: usize,
    /// Operations carried over to the next cycle without being attempted
    pub deferred: usize,
}

impl CycleSummary {
    /// Nothing was attempted: the target already matched the source.
    pub fn is_empty(&self) -> bool {
        self.added + self.removed + self.moved + self.failed + self.deferred == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    CycleStarted {
        task: String,
        cycle: u64,
    },
    OperationApplied {
        task: String,
        op: OperationId,
        outcome: OperationOutcome,
    },
    CycleFinished {
        task: String,
        cycle: u64,
        summary: CycleSummary,
    },
    /// The cycle ended before committing
    CycleAbandoned {
        task: String,
        cycle: u64,
        reason: String,
    },
    SchedulerBackoff {
        task: String,
        failures: u32,
        delay: Duration,
    },
    PlaylistRemoved {
        id: String,
        name: String,
    },
    /// A liked track playing outside Liked Songs was skipped
    TrackSkipped {
        track_id: String,
        title: String,
    },
}

/// Fan-out channel for [`SyncEvent`]s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitting_without_subscribers_is_fine() {
        EventBus::new(4).emit(SyncEvent::PlaylistRemoved {
            id: "p".into(),
            name: "My Playlist #1".into(),
        });
    }

    #[test]
    fn every_subscriber_sees_every_event() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(SyncEvent::CycleStarted { task: "liked".into(), cycle: 1 });

        let events = testing::drain(&mut first);
        assert_eq!(events.len(), 1);
        assert_eq!(events, testing::drain(&mut second));
    }

    #[test]
    fn empty_summaries() {
        assert!(CycleSummary::default().is_empty());
        assert!(!CycleSummary { moved: 1, ..Default::default() }.is_empty());
        assert!(!CycleSummary { deferred: 1, ..Default::default() }.is_empty());
    }
}
