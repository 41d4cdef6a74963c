// In-Memory Realtime Transport
//
// In-process implementation of `RealtimeTransport`: per-topic presence tables,
// join/leave/sync fan-out on track and unsubscribe, and table-filtered insert
// delivery. Acknowledgements can be held back and failures injected.

use super::{
    ChannelEvent, PresenceEvent, PresenceTable, RealtimeTransport, SubscribeOptions,
    Subscription, SubscriptionId,
};
use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch, RwLock};

struct Subscriber {
    topic: String,
    options: SubscribeOptions,
    sender: mpsc::UnboundedSender<ChannelEvent>,
}

/// Record tracked under a presence key
struct TrackedRecord {
    owner: Option<SubscriptionId>,
    payload: JsonValue,
}

#[derive(Default)]
struct State {
    subscribers: HashMap<SubscriptionId, Subscriber>,
    /// topic -> presence key -> records
    presence: HashMap<String, HashMap<String, Vec<TrackedRecord>>>,
}

impl State {
    fn broadcast(&self, topic: &str, event: ChannelEvent) {
        for subscriber in self.subscribers.values().filter(|s| s.topic == topic) {
            let _ = subscriber.sender.send(event.clone());
        }
    }
}

/// In-process realtime service
pub struct InMemoryTransport {
    state: RwLock<State>,
    acks_open: watch::Sender<bool>,
    fail_presence_state: AtomicBool,
    fail_next_unsubscribe: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (acks_open, _) = watch::channel(true);
        Self {
            state: RwLock::new(State::default()),
            acks_open,
            fail_presence_state: AtomicBool::new(false),
            fail_next_unsubscribe: AtomicBool::new(false),
        }
    }

    /// Stop acknowledging subscriptions until `release_acknowledgements`
    pub fn hold_acknowledgements(&self) {
        self.acks_open.send_replace(false);
    }

    pub fn release_acknowledgements(&self) {
        self.acks_open.send_replace(true);
    }

    /// Make every presence table read fail while set
    pub fn set_presence_state_failure(&self, fail: bool) {
        self.fail_presence_state.store(fail, Ordering::SeqCst);
    }

    /// Fail the next unsubscribe call, leaving that subscription in place
    pub fn fail_next_unsubscribe(&self) {
        self.fail_next_unsubscribe.store(true, Ordering::SeqCst);
    }

    /// Number of live subscriptions on a topic
    pub async fn live_subscriptions(&self, topic: &str) -> usize {
        let state = self.state.read().await;
        state
            .subscribers
            .values()
            .filter(|s| s.topic == topic)
            .count()
    }

    /// Total number of live subscriptions
    pub async fn total_subscriptions(&self) -> usize {
        self.state.read().await.subscribers.len()
    }

    /// Deliver an event to every subscriber of a topic
    pub async fn emit(&self, topic: &str, event: ChannelEvent) {
        self.state.read().await.broadcast(topic, event);
    }

    /// Deliver an inserted row to every subscriber filtered on `table`
    pub async fn insert_row(&self, table: &str, row: JsonValue) -> usize {
        let state = self.state.read().await;
        let mut delivered = 0;
        for subscriber in state
            .subscribers
            .values()
            .filter(|s| s.options.table.as_deref() == Some(table))
        {
            let event = ChannelEvent::Insert {
                table: table.to_string(),
                row: row.clone(),
            };
            if subscriber.sender.send(event).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// File a record under `key` directly, without notifying anyone
    pub async fn put_presence(&self, topic: &str, key: &str, payload: JsonValue) {
        let mut state = self.state.write().await;
        state
            .presence
            .entry(topic.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .push(TrackedRecord {
                owner: None,
                payload,
            });
    }

    /// Drop every record under `key` directly, without notifying anyone
    pub async fn remove_presence(&self, topic: &str, key: &str) {
        let mut state = self.state.write().await;
        if let Some(table) = state.presence.get_mut(topic) {
            table.remove(key);
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryTransport {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError> {
        let mut acks = self.acks_open.subscribe();
        if acks.wait_for(|open| *open).await.is_err() {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "transport shut down".to_string(),
            });
        }

        let (sender, events) = mpsc::unbounded_channel();
        let id = SubscriptionId::new();

        let mut state = self.state.write().await;
        // New subscribers start from a full sync.
        let _ = sender.send(ChannelEvent::Presence(PresenceEvent::Sync));
        state.subscribers.insert(
            id,
            Subscriber {
                topic: topic.to_string(),
                options,
                sender,
            },
        );
        tracing::debug!("Subscription {} opened on '{}'", id, topic);

        Ok(Subscription { id, events })
    }

    async fn track(
        &self,
        subscription: SubscriptionId,
        record: JsonValue,
    ) -> Result<(), TransportError> {
        let mut state = self.state.write().await;
        let subscriber = state
            .subscribers
            .get(&subscription)
            .ok_or(TransportError::UnknownSubscription(subscription))?;
        let topic = subscriber.topic.clone();
        let key = subscriber
            .options
            .presence_key
            .clone()
            .ok_or_else(|| TransportError::Track {
                topic: topic.clone(),
                reason: "subscription has no presence key".to_string(),
            })?;

        let records = state
            .presence
            .entry(topic.clone())
            .or_default()
            .entry(key.clone())
            .or_default();
        records.retain(|r| r.owner != Some(subscription));
        records.push(TrackedRecord {
            owner: Some(subscription),
            payload: record.clone(),
        });

        state.broadcast(
            &topic,
            ChannelEvent::Presence(PresenceEvent::Join {
                key,
                records: vec![record],
            }),
        );
        state.broadcast(&topic, ChannelEvent::Presence(PresenceEvent::Sync));
        Ok(())
    }

    async fn presence_state(&self, topic: &str) -> Result<PresenceTable, TransportError> {
        if self.fail_presence_state.load(Ordering::SeqCst) {
            return Err(TransportError::PresenceState {
                topic: topic.to_string(),
                reason: "presence state unavailable".to_string(),
            });
        }

        let state = self.state.read().await;
        let table = state
            .presence
            .get(topic)
            .map(|keys| {
                keys.iter()
                    .filter(|(_, records)| !records.is_empty())
                    .map(|(key, records)| {
                        (
                            key.clone(),
                            records.iter().map(|r| r.payload.clone()).collect(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(table)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), TransportError> {
        let mut state = self.state.write().await;
        let topic = state
            .subscribers
            .get(&subscription)
            .map(|s| s.topic.clone())
            .ok_or(TransportError::UnknownSubscription(subscription))?;

        if self.fail_next_unsubscribe.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Unsubscribe {
                topic,
                reason: "injected failure".to_string(),
            });
        }

        state.subscribers.remove(&subscription);

        let mut departed: Vec<(String, Vec<JsonValue>)> = Vec::new();
        if let Some(table) = state.presence.get_mut(&topic) {
            for (key, records) in table.iter_mut() {
                let (gone, kept): (Vec<_>, Vec<_>) = records
                    .drain(..)
                    .partition(|r| r.owner == Some(subscription));
                *records = kept;
                if !gone.is_empty() {
                    departed.push((key.clone(), gone.into_iter().map(|r| r.payload).collect()));
                }
            }
            table.retain(|_, records| !records.is_empty());
        }

        for (key, records) in departed {
            state.broadcast(
                &topic,
                ChannelEvent::Presence(PresenceEvent::Leave { key, records }),
            );
            state.broadcast(&topic, ChannelEvent::Presence(PresenceEvent::Sync));
        }

        tracing::debug!("Subscription {} closed on '{}'", subscription, topic);
        Ok(())
    }
}
