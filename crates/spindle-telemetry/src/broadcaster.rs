//! Per-topic state broadcaster.
//!
//! Publishers hand in whole states. Subscribers first receive the full state
//! of every topic, then only diffs. A subscriber that lags behind the channel
//! is resynchronized with full states instead of replaying stale diffs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::diff::{diff, StateMap};

/// Default number of buffered messages per subscriber.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Full,
    Diff,
}

/// One message to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
    pub kind: PayloadKind,
    pub payload: StateMap,
}

impl TopicMessage {
    fn full(topic: &str, payload: StateMap) -> Self {
        Self {
            topic: topic.to_string(),
            kind: PayloadKind::Full,
            payload,
        }
    }
}

struct Inner {
    topics: BTreeMap<String, StateMap>,
    tx: broadcast::Sender<TopicMessage>,
}

impl Inner {
    fn snapshots(&self) -> VecDeque<TopicMessage> {
        self.topics
            .iter()
            .map(|(topic, state)| TopicMessage::full(topic, state.clone()))
            .collect()
    }
}

/// Remembers the last state per topic and fans out changes.
#[derive(Clone)]
pub struct StateBroadcaster {
    inner: Arc<Mutex<Inner>>,
}

impl StateBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(Inner {
                topics: BTreeMap::new(),
                tx,
            })),
        }
    }

    /// Record the new state of `topic`.
    ///
    /// Returns the message sent: a full state the first time a topic is
    /// seen, a diff afterwards, nothing if the state did not change.
    pub fn publish(&self, topic: &str, state: StateMap) -> Option<TopicMessage> {
        let mut inner = self.inner.lock();
        let message = match inner.topics.get(topic) {
            None => TopicMessage::full(topic, state.clone()),
            Some(previous) => TopicMessage {
                topic: topic.to_string(),
                kind: PayloadKind::Diff,
                payload: diff(previous, &state)?,
            },
        };
        inner.topics.insert(topic.to_string(), state);
        if inner.tx.send(message.clone()).is_err() {
            debug!(category = "telemetry", topic, "No telemetry subscribers");
        }
        Some(message)
    }

    /// Last state recorded for `topic`.
    pub fn current(&self, topic: &str) -> Option<StateMap> {
        self.inner.lock().topics.get(topic).cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.lock().topics.keys().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().tx.receiver_count()
    }

    /// Subscribe. The first messages are full states of all known topics.
    pub fn subscribe(&self) -> StateSubscriber {
        let inner = self.inner.lock();
        StateSubscriber {
            pending: inner.snapshots(),
            rx: inner.tx.subscribe(),
            source: Arc::downgrade(&self.inner),
        }
    }
}

impl Default for StateBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`StateBroadcaster`].
pub struct StateSubscriber {
    pending: VecDeque<TopicMessage>,
    rx: broadcast::Receiver<TopicMessage>,
    source: Weak<Mutex<Inner>>,
}

impl StateSubscriber {
    /// Next message, or `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<TopicMessage> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(category = "telemetry", skipped, "Telemetry subscriber lagged, resyncing");
                    self.resync();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next message if one is ready.
    pub fn try_recv(&mut self) -> Option<TopicMessage> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(_)) => self.resync(),
                Err(_) => return None,
            }
        }
    }

    /// Replace everything buffered with fresh full states. Publishing holds
    /// the same lock, so no diff can slip in between the drain and the
    /// snapshot.
    fn resync(&mut self) {
        let Some(source) = self.source.upgrade() else {
            return;
        };
        let inner = source.lock();
        while !matches!(
            self.rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed)
        ) {}
        self.pending = inner.snapshots();
    }
}
