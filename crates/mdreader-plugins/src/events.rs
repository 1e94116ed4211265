//! Lifecycle events for the host.
//!
//! The host registers its `onReady` / `onError` / `onMessage` hooks by
//! subscribing to the loader's broadcaster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event raised by a loaded plugin or by the loader on its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginEvent {
    /// Handshake completed; the plugin accepts requests.
    Ready {
        /// Plugin ID.
        id: String,
    },

    /// Loading failed or the plugin broke.
    Error {
        /// Plugin ID.
        id: String,
        /// Error description.
        error: String,
    },

    /// Unsolicited message from the plugin.
    Message {
        /// Plugin ID.
        id: String,
        /// The message as received.
        event: serde_json::Value,
    },

    /// Plugin process terminated on its own.
    Exited {
        /// Plugin ID.
        id: String,
        /// Exit code, if any.
        code: Option<i32>,
    },
}

impl PluginEvent {
    /// Plugin the event concerns.
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        match self {
            Self::Ready { id } | Self::Error { id, .. } | Self::Message { id, .. } | Self::Exited { id, .. } => id,
        }
    }
}

/// An event with its timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEventEnvelope {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// The event payload.
    pub event: PluginEvent,
}

/// Default channel capacity for event broadcasts.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Event broadcaster for distributing plugin events to subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<PluginEventEnvelope>,
}

impl EventBroadcaster {
    /// Create a new event broadcaster.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event broadcaster with custom capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcast an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn broadcast(&self, event: PluginEvent) -> usize {
        let envelope = PluginEventEnvelope {
            timestamp: Utc::now(),
            event,
        };
        // No subscribers is not an error
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Subscribe to receive events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEventEnvelope> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
