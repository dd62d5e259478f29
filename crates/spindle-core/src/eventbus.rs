//! Event bus connecting the engine components.
//!
//! The session, queue, watchdog and plugin host publish here; the telemetry
//! service, the jog controller and any UI bridge subscribe.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use crate::event::{EngineEvent, EventMetadata};

/// Events buffered per subscriber before the oldest are dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

type Envelope = (EngineEvent, EventMetadata);

/// Predicate selecting the events a [`FilteredReceiver`] yields.
pub type EventFilter = fn(&EngineEvent) -> bool;

/// Broadcast bus for [`EngineEvent`]s.
///
/// Publishing never waits. A subscriber that falls behind loses its oldest
/// events and is told how many through a warning.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish `event` stamped with `source`. Returns `false` when nobody
    /// is listening.
    pub fn publish(&self, source: &str, event: EngineEvent) -> bool {
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to the events accepted by `filter`.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            inner: self.subscribe(),
            filter,
        }
    }

    /// Controller lines as classified by the protocol session.
    pub fn session_events(&self) -> FilteredReceiver {
        self.subscribe_filtered(EngineEvent::is_session_event)
    }

    /// Job lifecycle, transmitted lines and progress.
    pub fn job_events(&self) -> FilteredReceiver {
        self.subscribe_filtered(EngineEvent::is_job_event)
    }

    pub fn watchdog_events(&self) -> FilteredReceiver {
        self.subscribe_filtered(EngineEvent::is_watchdog_event)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives every event published on the bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<Envelope>,
}

impl EventBusReceiver {
    /// Next event, or `None` once every bus handle is dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(category = "events", skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(category = "events", skipped, "Event subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Receives the subset of events accepted by a filter.
pub struct FilteredReceiver {
    inner: EventBusReceiver,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let envelope = self.inner.recv().await?;
            if (self.filter)(&envelope.0) {
                return Some(envelope);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            let envelope = self.inner.try_recv()?;
            if (self.filter)(&envelope.0) {
                return Some(envelope);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::LineOrigin;

    #[tokio::test]
    async fn test_subscriber_sees_source_and_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish(
            "session",
            EngineEvent::SystemMessage {
                message: "Grbl 1.1h".into()
            }
        ));

        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "SystemMessage");
        assert_eq!(meta.source, "session");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert!(!bus.publish("session", EngineEvent::Unmatched { line: "x".into() }));
    }

    #[tokio::test]
    async fn test_job_events_skip_session_lines() {
        let bus = EventBus::new();
        let mut rx = bus.job_events();

        bus.publish("session", EngineEvent::Unmatched { line: "x".into() });
        bus.publish(
            "queue",
            EngineEvent::LineSent {
                line_number: Some(1),
                text: "G0 X1".into(),
                origin: LineOrigin::Job,
            },
        );

        let (event, _) = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "LineSent");
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_lagged_receiver_keeps_newest() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.watchdog_events();
        for i in 0..5 {
            bus.publish(
                "watchdog",
                EngineEvent::WatchdogCleared {
                    command_id: format!("jog-{i}"),
                },
            );
        }

        let mut seen = Vec::new();
        while let Some((EngineEvent::WatchdogCleared { command_id }, _)) = rx.try_recv() {
            seen.push(command_id);
        }
        assert_eq!(seen, vec!["jog-3", "jog-4"]);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
