use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::dao::models::{ScheduledEvent, WakeHint};

/// Signals that cut the daemon's wait short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeSignal {
    /// A near-term row was written.
    Hint(WakeHint),
    /// The database subscription was re-established; hints may have been missed.
    Resubscribed,
}

/// In-process fan-out of wake signals, fed by the write path and the database
/// listener, consumed by the polling daemon.
pub struct WakeHub {
    sender: broadcast::Sender<WakeSignal>,
}

impl WakeHub {
    /// Construct a hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New receiver for wake signals published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WakeSignal> {
        self.sender.subscribe()
    }

    /// Best effort; returns how many receivers got the signal.
    pub fn publish(&self, signal: WakeSignal) -> usize {
        self.sender.send(signal).unwrap_or(0)
    }

    /// Publish one hint per pending row due within `horizon`, returning how
    /// many rows qualified.
    pub fn publish_near_term(
        &self,
        events: &[ScheduledEvent],
        now: OffsetDateTime,
        horizon: Duration,
    ) -> usize {
        events
            .iter()
            .filter(|event| event.is_near_term(now, horizon))
            .map(|event| self.publish(WakeSignal::Hint(WakeHint::inserted(event))))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use uuid::Uuid;

    use super::*;
    use crate::dao::models::{EventKind, NewScheduledEvent};

    fn event_due(due_at: OffsetDateTime) -> ScheduledEvent {
        ScheduledEvent::pending(
            Uuid::new_v4(),
            NewScheduledEvent {
                kind: EventKind::Reminder { offset_minutes: 5 },
                due_at,
            },
            due_at,
        )
    }

    #[test]
    fn only_near_term_rows_wake_the_daemon() {
        let hub = WakeHub::new(8);
        let mut receiver = hub.subscribe();
        let now = datetime!(2026-10-19 18:00 UTC);
        let soon = event_due(now + time::Duration::minutes(3));
        let later = event_due(now + time::Duration::hours(4));

        let published = hub.publish_near_term(
            &[soon.clone(), later],
            now,
            Duration::from_secs(600),
        );

        assert_eq!(published, 1);
        assert_eq!(
            receiver.try_recv().unwrap(),
            WakeSignal::Hint(WakeHint::inserted(&soon))
        );
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn publishing_without_receivers_is_harmless() {
        let hub = WakeHub::new(1);
        assert_eq!(hub.publish(WakeSignal::Resubscribed), 0);
    }
}
