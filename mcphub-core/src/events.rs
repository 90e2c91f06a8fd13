//! Hub event bus.
//!
//! A closed set of event variants fanned out over a `tokio::sync::broadcast`
//! channel. Publishers never block and never fail because nobody is
//! listening; each subscriber filters by [`Topic`] and survives lag.

use tokio::sync::broadcast;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Event categories a subscriber can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// The set of visible tools changed.
    Tools,
    /// A proxy session registered or went away.
    Sessions,
}

/// Everything the hub's subsystems tell each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A provider's tools were prepared or removed.
    ToolsChanged { provider: String },
    /// A proxy completed the registration handshake.
    SessionRegistered {
        session_id: String,
        proxy_id: String,
        proxy_name: String,
    },
    /// A proxy session was removed from the live set.
    SessionClosed {
        session_id: String,
        proxy_id: Option<String>,
    },
}

impl HubEvent {
    pub fn topic(&self) -> Topic {
        match self {
            HubEvent::ToolsChanged { .. } => Topic::Tools,
            HubEvent::SessionRegistered { .. } | HubEvent::SessionClosed { .. } => {
                Topic::Sessions
            }
        }
    }
}

/// Cheaply cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that will see it;
    /// zero is not an error.
    pub fn publish(&self, event: HubEvent) -> usize {
        tracing::debug!(?event, "publishing hub event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to the given topics. An empty slice means every topic.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: topics.to_vec(),
        }
    }
}

/// Receiving side of an [`EventBus`] subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<HubEvent>,
    topics: Vec<Topic>,
}

impl Subscription {
    /// Wait for the next event on a subscribed topic.
    ///
    /// Returns `None` once every [`EventBus`] handle has been dropped. Events
    /// missed because this subscriber fell behind are logged and skipped.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn wants(&self, event: &HubEvent) -> bool {
        self.topics.is_empty() || self.topics.contains(&event.topic())
    }
}
