// Channel Handle
//
// One subscription to a named topic: status tracking, idempotent listener
// registration, event dispatch and idempotent close.

use super::generation::Generation;
use crate::error::ChannelError;
use crate::transport::{
    ChannelEvent, EventClass, PresenceTable, RealtimeTransport, SubscribeOptions, Subscription,
    SubscriptionId,
};
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Lifecycle status of a channel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Connecting,
    Subscribed,
    Closing,
    Closed,
}

impl ChannelStatus {
    /// Connecting or subscribed
    pub fn is_live(self) -> bool {
        matches!(self, ChannelStatus::Connecting | ChannelStatus::Subscribed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelStatus::Closing | ChannelStatus::Closed)
    }
}

/// Identity a handler is registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(Cow<'static, str>);

impl ListenerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for ListenerId {
    fn from(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event handler. Failures are handled inside; nothing escapes dispatch.
pub type EventHandler = Arc<dyn Fn(ChannelEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct Listener {
    id: ListenerId,
    handler: EventHandler,
}

/// Handle on one topic subscription
pub struct ChannelHandle {
    topic: String,
    generation: Generation,
    transport: Arc<dyn RealtimeTransport>,
    status: watch::Sender<ChannelStatus>,
    listeners: Mutex<HashMap<EventClass, Vec<Listener>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle {
    pub fn new(
        topic: impl Into<String>,
        transport: Arc<dyn RealtimeTransport>,
        generation: Generation,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ChannelStatus::Idle);
        Arc::new(Self {
            topic: topic.into(),
            generation,
            transport,
            status,
            listeners: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
            driver: Mutex::new(None),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    /// Live and belonging to the current generation
    pub fn is_current(&self) -> bool {
        self.status().is_live() && self.generation.is_current()
    }

    /// Request the subscription.
    ///
    /// Status becomes Connecting now and Subscribed when the transport
    /// acknowledges. Only an Idle handle can be opened.
    pub async fn open(self: &Arc<Self>, options: SubscribeOptions) {
        let opened = self.status.send_if_modified(|status| {
            if *status == ChannelStatus::Idle {
                *status = ChannelStatus::Connecting;
                true
            } else {
                false
            }
        });
        if !opened {
            tracing::warn!(
                "Channel '{}' is {:?}, ignoring open request",
                self.topic,
                self.status()
            );
            return;
        }

        tracing::debug!(
            "Opening channel '{}' (generation {})",
            self.topic,
            self.generation.value()
        );
        let driver = tokio::spawn(run_subscription(
            Arc::downgrade(self),
            self.transport.clone(),
            self.topic.clone(),
            options,
            self.status.subscribe(),
        ));
        *self.driver.lock().await = Some(driver);
    }

    /// Register `handler` for `class` under `id`.
    ///
    /// Returns false, registering nothing, when `id` is already registered
    /// for `class` or the handle is closing.
    pub async fn on(&self, class: EventClass, id: impl Into<ListenerId>, handler: EventHandler) -> bool {
        let id = id.into();
        let mut listeners = self.listeners.lock().await;
        if self.status().is_terminal() {
            return false;
        }

        let registered = listeners.entry(class).or_default();
        if registered.iter().any(|l| l.id == id) {
            tracing::debug!(
                "Listener '{}' already registered for {:?} on '{}'",
                id,
                class,
                self.topic
            );
            return false;
        }
        registered.push(Listener { id, handler });
        true
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.values().map(Vec::len).sum()
    }

    /// Wait until Subscribed. Returns false if the handle closes first.
    pub async fn wait_subscribed(&self) -> bool {
        wait_until_subscribed(&mut self.status.subscribe()).await
    }

    /// Publish a presence record on this subscription
    pub async fn track(&self, record: JsonValue) -> Result<(), ChannelError> {
        let id = (*self.subscription.lock().await).ok_or_else(|| ChannelError::NotSubscribed {
            topic: self.topic.clone(),
        })?;
        self.transport.track(id, record).await?;
        Ok(())
    }

    /// Read the authoritative presence table of this topic
    pub async fn presence_state(&self) -> Result<PresenceTable, ChannelError> {
        Ok(self.transport.presence_state(&self.topic).await?)
    }

    /// Close the handle.
    ///
    /// Safe from any status and any number of times. Returns after the
    /// subscription driver has stopped, so an acknowledgement that raced the
    /// close has been released too. When releasing the remote subscription
    /// fails the handle stays Closing and keeps the subscription, and the
    /// next call retries the release. Must not be called from an event
    /// handler of the same handle.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.status() == ChannelStatus::Closed {
            return Ok(());
        }
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = ChannelStatus::Closing;
                true
            }
        });

        self.listeners.lock().await.clear();
        let driver = self.driver.lock().await.take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                tracing::error!("Subscription driver for '{}' failed: {}", self.topic, e);
            }
        }

        // Held across the release so concurrent closes see a settled slot.
        let mut slot = self.subscription.lock().await;
        if self.status() == ChannelStatus::Closed {
            return Ok(());
        }
        let result = match *slot {
            Some(id) => self
                .transport
                .unsubscribe(id)
                .await
                .map_err(ChannelError::from),
            None => Ok(()),
        };

        match &result {
            Ok(()) => {
                *slot = None;
                self.status.send_replace(ChannelStatus::Closed);
                tracing::info!("Channel '{}' closed", self.topic);
            }
            Err(e) => tracing::warn!(
                "Channel '{}' left closing, release will be retried: {}",
                self.topic,
                e
            ),
        }
        result
    }

    /// Record the acknowledged subscription unless the handle was closed meanwhile
    async fn acknowledge(&self, id: SubscriptionId) -> bool {
        let mut slot = self.subscription.lock().await;
        let acknowledged = self.status.send_if_modified(|status| {
            if *status == ChannelStatus::Connecting {
                *status = ChannelStatus::Subscribed;
                true
            } else {
                false
            }
        });
        if acknowledged {
            *slot = Some(id);
        }
        acknowledged
    }

    async fn dispatch(&self, event: ChannelEvent) {
        if !self.status().is_live() {
            return;
        }
        let class = event.class();
        let handlers: Vec<EventHandler> = {
            let listeners = self.listeners.lock().await;
            listeners
                .get(&class)
                .map(|ls| ls.iter().map(|l| l.handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(event.clone()).await;
        }
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("topic", &self.topic)
            .field("generation", &self.generation.value())
            .field("status", &self.status())
            .finish()
    }
}

pub(crate) async fn wait_until_subscribed(status: &mut watch::Receiver<ChannelStatus>) -> bool {
    match status
        .wait_for(|s| *s == ChannelStatus::Subscribed || s.is_terminal())
        .await
    {
        Ok(current) => *current == ChannelStatus::Subscribed,
        Err(_) => false,
    }
}

async fn wait_until_terminal(status: &mut watch::Receiver<ChannelStatus>) {
    let _ = status.wait_for(|s| s.is_terminal()).await;
}

/// Drives one subscription: waits for the acknowledgement, then feeds events
/// to the handle's listeners until the handle closes or goes away.
async fn run_subscription(
    handle: Weak<ChannelHandle>,
    transport: Arc<dyn RealtimeTransport>,
    topic: String,
    options: SubscribeOptions,
    mut status: watch::Receiver<ChannelStatus>,
) {
    let subscribed = tokio::select! {
        result = transport.subscribe(&topic, options) => result,
        _ = wait_until_terminal(&mut status) => {
            tracing::debug!("Channel '{}' closed before acknowledgement", topic);
            return;
        }
    };

    let Subscription { id, mut events } = match subscribed {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!("Channel '{}' failed to subscribe: {}", topic, e);
            return;
        }
    };

    let acknowledged = match handle.upgrade() {
        Some(handle) => handle.acknowledge(id).await,
        None => false,
    };
    if !acknowledged {
        tracing::debug!(
            "Acknowledgement for '{}' arrived after close, releasing {}",
            topic,
            id
        );
        if let Err(e) = transport.unsubscribe(id).await {
            tracing::warn!("Failed to release late subscription on '{}': {}", topic, e);
        }
        return;
    }
    tracing::info!("Channel '{}' subscribed via {}", topic, transport.name());

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::debug!("Event stream for '{}' ended", topic);
                    break;
                };
                let Some(handle) = handle.upgrade() else {
                    break;
                };
                handle.dispatch(event).await;
            }
            _ = wait_until_terminal(&mut status) => break,
        }
    }

    // Dropped without close: nobody else will release the subscription.
    if handle.upgrade().is_none() {
        tracing::debug!("Channel '{}' dropped while subscribed, releasing {}", topic, id);
        if let Err(e) = transport.unsubscribe(id).await {
            tracing::warn!("Failed to release dropped subscription on '{}': {}", topic, e);
        }
    }
}
