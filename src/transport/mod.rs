// Realtime Transport Interface
//
// Topic-based publish/subscribe contract of the remote realtime service.
// Presence topics carry sync/join/leave events and expose the authoritative
// presence table; change topics deliver inserted rows of one table.

pub mod memory;

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use memory::InMemoryTransport;

/// Authoritative presence table: presence key -> every record tracked under it
pub type PresenceTable = HashMap<String, Vec<JsonValue>>;

/// Identifier of one remote subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription request options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Key the subscriber's tracked presence is filed under
    pub presence_key: Option<String>,

    /// Restrict change delivery to inserted rows of this table
    pub table: Option<String>,
}

impl SubscribeOptions {
    pub fn presence(key: impl Into<String>) -> Self {
        Self {
            presence_key: Some(key.into()),
            table: None,
        }
    }

    pub fn table_inserts(table: impl Into<String>) -> Self {
        Self {
            presence_key: None,
            table: Some(table.into()),
        }
    }
}

/// Presence event delivered on a presence topic
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// The presence table changed; re-read it in full
    Sync,
    /// Records were tracked under `key`
    Join { key: String, records: Vec<JsonValue> },
    /// Records tracked under `key` went away
    Leave { key: String, records: Vec<JsonValue> },
}

/// Event delivered to a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Presence(PresenceEvent),
    Insert { table: String, row: JsonValue },
}

/// Class a listener registers for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Sync,
    Join,
    Leave,
    Insert,
}

impl ChannelEvent {
    pub fn class(&self) -> EventClass {
        match self {
            ChannelEvent::Presence(PresenceEvent::Sync) => EventClass::Sync,
            ChannelEvent::Presence(PresenceEvent::Join { .. }) => EventClass::Join,
            ChannelEvent::Presence(PresenceEvent::Leave { .. }) => EventClass::Leave,
            ChannelEvent::Insert { .. } => EventClass::Insert,
        }
    }
}

/// An acknowledged subscription and its event stream.
///
/// The stream ends when the service drops the subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Remote realtime service
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Service name, for logs
    fn name(&self) -> &str;

    /// Request a subscription. Resolves once the service acknowledges it;
    /// may stay pending indefinitely when the service never does.
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError>;

    /// Publish a presence record under the subscription's presence key
    async fn track(
        &self,
        subscription: SubscriptionId,
        record: JsonValue,
    ) -> Result<(), TransportError>;

    /// Read the current authoritative presence table of a topic
    async fn presence_state(&self, topic: &str) -> Result<PresenceTable, TransportError>;

    /// Release a subscription and everything it tracked
    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), TransportError>;
}
