// Notification Channel
//
// Watches inserted rows of the supervisor message log and counts messages
// authored by someone other than the local session.

use super::generation::Generation;
use super::handle::{ChannelHandle, ChannelStatus, EventHandler};
use crate::config::RealtimeConfig;
use crate::error::ChannelError;
use crate::session::Session;
use crate::transport::{ChannelEvent, EventClass, RealtimeTransport, SubscribeOptions};
use futures::FutureExt;
use serde::Deserialize;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Unread counters. Both only ever grow until reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadState {
    /// Foreign messages received
    pub received: u64,
    /// Value of `received` when the user last looked
    pub seen: u64,
}

impl UnreadState {
    pub fn has_unread(&self) -> bool {
        self.received > self.seen
    }

    pub fn unread(&self) -> u64 {
        self.received.saturating_sub(self.seen)
    }
}

/// Unread signal observed by the UI
#[derive(Debug)]
pub struct UnreadSignal {
    state: watch::Sender<UnreadState>,
}

impl UnreadSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(UnreadState::default());
        Self { state }
    }

    pub fn state(&self) -> UnreadState {
        *self.state.borrow()
    }

    pub fn has_unread(&self) -> bool {
        self.state().has_unread()
    }

    pub fn watch(&self) -> watch::Receiver<UnreadState> {
        self.state.subscribe()
    }

    fn record_foreign(&self) {
        self.state.send_modify(|s| s.received += 1);
    }

    /// Everything received so far has been seen
    pub fn mark_seen(&self) {
        self.state.send_if_modified(|s| {
            if s.seen == s.received {
                false
            } else {
                s.seen = s.received;
                true
            }
        });
    }

    fn reset(&self) {
        self.state.send_replace(UnreadState::default());
    }
}

impl Default for UnreadSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct InsertedMessage {
    sender: String,
}

fn insert_handler(
    handle: Weak<ChannelHandle>,
    unread: Arc<UnreadSignal>,
    table: String,
    local_key: String,
) -> EventHandler {
    Arc::new(move |event: ChannelEvent| {
        let handle = handle.clone();
        let unread = unread.clone();
        let table = table.clone();
        let local_key = local_key.clone();
        async move {
            let ChannelEvent::Insert { table: source, row } = event else {
                return;
            };
            if source != table {
                return;
            }
            let Some(handle) = handle.upgrade() else {
                return;
            };
            if !handle.is_current() {
                tracing::debug!("Dropping stale insert on '{}'", handle.topic());
                return;
            }

            match serde_json::from_value::<InsertedMessage>(row) {
                Ok(message) if message.sender != local_key => {
                    unread.record_foreign();
                    tracing::debug!("New message from '{}' on '{}'", message.sender, table);
                }
                Ok(_) => {}
                Err(e) => {
                    let e = ChannelError::Payload {
                        topic: handle.topic().to_string(),
                        source: e,
                    };
                    tracing::warn!("{}", e);
                }
            }
        }
        .boxed()
    })
}

/// Supervisor-chat notification channel of one session
pub struct NotificationChannel {
    handle: Arc<ChannelHandle>,
    unread: Arc<UnreadSignal>,
}

impl NotificationChannel {
    /// Open the notification topic, or return `None` when the session does
    /// not qualify for chat notifications. Nothing is opened in that case.
    pub async fn open(
        transport: Arc<dyn RealtimeTransport>,
        config: &RealtimeConfig,
        session: &Session,
        generation: Generation,
    ) -> Option<Self> {
        if !session.receives_chat_notifications() {
            tracing::debug!(
                "Session '{}' does not receive chat notifications",
                session.display_key()
            );
            return None;
        }

        let handle = ChannelHandle::new(config.notification_topic.clone(), transport, generation);
        let unread = Arc::new(UnreadSignal::new());
        handle
            .on(
                EventClass::Insert,
                "notification.insert",
                insert_handler(
                    Arc::downgrade(&handle),
                    unread.clone(),
                    config.notification_table.clone(),
                    session.display_key().to_string(),
                ),
            )
            .await;
        handle
            .open(SubscribeOptions::table_inserts(
                config.notification_table.clone(),
            ))
            .await;

        Some(Self { handle, unread })
    }

    pub fn status(&self) -> ChannelStatus {
        self.handle.status()
    }

    pub fn generation(&self) -> u64 {
        self.handle.generation().value()
    }

    pub fn has_unread(&self) -> bool {
        self.unread.has_unread()
    }

    pub fn unread_count(&self) -> u64 {
        self.unread.state().unread()
    }

    pub fn unread(&self) -> UnreadState {
        self.unread.state()
    }

    pub fn watch_unread(&self) -> watch::Receiver<UnreadState> {
        self.unread.watch()
    }

    /// The chat view was opened; clear the unread signal
    pub fn mark_seen(&self) {
        self.unread.mark_seen();
    }

    /// Close the channel and reset the unread signal, even when the close fails
    pub async fn close(&self) -> Result<(), ChannelError> {
        let result = self.handle.close().await;
        self.unread.reset();
        result
    }

    pub(crate) fn handle(&self) -> &Arc<ChannelHandle> {
        &self.handle
    }
}
