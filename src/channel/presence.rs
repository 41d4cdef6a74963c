// Presence Channel
//
// Announces the local session on the presence topic and keeps a reconciled
// roster of everyone present. Every update re-reads the authoritative
// presence table; delta payloads are never trusted.

use super::generation::Generation;
use super::handle::{wait_until_subscribed, ChannelHandle, ChannelStatus, EventHandler};
use super::registry::{PresencePayload, PresenceRecord, PresenceRegistry};
use crate::config::RealtimeConfig;
use crate::error::ChannelError;
use crate::session::Session;
use crate::transport::{ChannelEvent, EventClass, RealtimeTransport, SubscribeOptions};
use chrono::Utc;
use futures::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Roster state shared by the channel and its handlers
struct Roster {
    topic: String,
    unknown_label: String,
    handle: Weak<ChannelHandle>,
    registry: watch::Sender<Arc<PresenceRegistry>>,
    state_version: AtomicU64,
}

impl Roster {
    /// Rebuild the registry from the authoritative table.
    ///
    /// Stale or failed refreshes leave the registry untouched.
    async fn refresh(&self, trigger: EventClass) {
        let Some(handle) = self.handle.upgrade() else {
            return;
        };
        if !handle.is_current() {
            tracing::debug!("Dropping stale {:?} refresh on '{}'", trigger, self.topic);
            return;
        }

        let table = match handle.presence_state().await {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!("Presence refresh on '{}' failed: {}", self.topic, e);
                return;
            }
        };

        let registry = PresenceRegistry::from_table(&table, &self.unknown_label);
        let users = registry.len();
        // Checked under the registry lock so a concurrent close cannot be undone.
        let replaced = self.registry.send_if_modified(|current| {
            if !handle.is_current() {
                return false;
            }
            *current = Arc::new(registry);
            true
        });
        if replaced {
            self.state_version.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                "Presence on '{}' now {} user(s) after {:?}",
                self.topic,
                users,
                trigger
            );
        } else {
            tracing::debug!(
                "Channel '{}' closed during {:?} refresh, discarding result",
                self.topic,
                trigger
            );
        }
    }

    fn clear(&self) {
        let cleared = self.registry.send_if_modified(|current| {
            if current.is_empty() {
                false
            } else {
                *current = Arc::new(PresenceRegistry::new());
                true
            }
        });
        if cleared {
            self.state_version.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn refresh_handler(roster: Arc<Roster>, trigger: EventClass) -> EventHandler {
    Arc::new(move |_event: ChannelEvent| {
        let roster = roster.clone();
        async move { roster.refresh(trigger).await }.boxed()
    })
}

/// A join may be reported before its record is readable, so the re-read is
/// deferred instead of blocking the dispatcher.
fn deferred_refresh_handler(roster: Arc<Roster>, delay: Duration) -> EventHandler {
    Arc::new(move |_event: ChannelEvent| {
        let roster = roster.clone();
        async move {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                roster.refresh(EventClass::Join).await;
            });
        }
        .boxed()
    })
}

/// Presence channel of one session
pub struct PresenceChannel {
    key: String,
    handle: Arc<ChannelHandle>,
    roster: Arc<Roster>,
}

impl PresenceChannel {
    /// Open the presence topic for `session` and announce it once subscribed
    pub async fn open(
        transport: Arc<dyn RealtimeTransport>,
        config: &RealtimeConfig,
        session: &Session,
        generation: Generation,
    ) -> Self {
        let team = session.team().unwrap_or(config.unassigned_team_label.as_str());
        let announcement = PresencePayload {
            online_at: Some(Utc::now()),
            user_name: Some(session.display_key().to_string()),
            team: Some(team.to_string()),
        };
        Self::start(
            transport,
            config,
            session.display_key().to_string(),
            generation,
            Some(announcement),
        )
        .await
    }

    /// Open the presence topic read-only: maintain the roster, announce nothing
    pub async fn observe(
        transport: Arc<dyn RealtimeTransport>,
        config: &RealtimeConfig,
        generation: Generation,
    ) -> Self {
        Self::start(
            transport,
            config,
            config.unknown_user_label.clone(),
            generation,
            None,
        )
        .await
    }

    async fn start(
        transport: Arc<dyn RealtimeTransport>,
        config: &RealtimeConfig,
        key: String,
        generation: Generation,
        announcement: Option<PresencePayload>,
    ) -> Self {
        let handle = ChannelHandle::new(config.presence_topic.clone(), transport, generation);
        let (registry, _) = watch::channel(Arc::new(PresenceRegistry::new()));
        let roster = Arc::new(Roster {
            topic: config.presence_topic.clone(),
            unknown_label: config.unknown_user_label.clone(),
            handle: Arc::downgrade(&handle),
            registry,
            state_version: AtomicU64::new(0),
        });

        // Listeners go in before the subscription so no event is missed.
        handle
            .on(
                EventClass::Sync,
                "presence.sync",
                refresh_handler(roster.clone(), EventClass::Sync),
            )
            .await;
        handle
            .on(
                EventClass::Join,
                "presence.join",
                deferred_refresh_handler(roster.clone(), config.join_resync_delay()),
            )
            .await;
        handle
            .on(
                EventClass::Leave,
                "presence.leave",
                refresh_handler(roster.clone(), EventClass::Leave),
            )
            .await;

        handle.open(SubscribeOptions::presence(key.clone())).await;
        tokio::spawn(announce(Arc::downgrade(&handle), handle.watch_status(), announcement));

        Self {
            key,
            handle,
            roster,
        }
    }

    /// Presence key this channel is filed under
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> ChannelStatus {
        self.handle.status()
    }

    pub fn generation(&self) -> u64 {
        self.handle.generation().value()
    }

    /// Current roster, ordered by key
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.roster.registry.borrow().snapshot()
    }

    pub fn registry(&self) -> Arc<PresenceRegistry> {
        self.roster.registry.borrow().clone()
    }

    /// Observe roster replacements
    pub fn watch(&self) -> watch::Receiver<Arc<PresenceRegistry>> {
        self.roster.registry.subscribe()
    }

    /// Number of registry replacements so far
    pub fn state_version(&self) -> u64 {
        self.roster.state_version.load(Ordering::SeqCst)
    }

    /// Re-read the presence table now
    pub async fn refresh(&self) {
        self.roster.refresh(EventClass::Sync).await;
    }

    /// Close the channel and empty the roster.
    ///
    /// The roster is emptied even when the close itself fails.
    pub async fn close(&self) -> Result<(), ChannelError> {
        let result = self.handle.close().await;
        self.roster.clear();
        result
    }

    pub(crate) fn handle(&self) -> &Arc<ChannelHandle> {
        &self.handle
    }
}

/// Publish the local record once subscribed
async fn announce(
    handle: Weak<ChannelHandle>,
    mut status: watch::Receiver<ChannelStatus>,
    announcement: Option<PresencePayload>,
) {
    if !wait_until_subscribed(&mut status).await {
        return;
    }
    let Some(handle) = handle.upgrade() else {
        return;
    };
    if !handle.is_current() {
        return;
    }

    if let Some(payload) = announcement {
        let user = payload.user_name.clone().unwrap_or_default();
        let record = match serde_json::to_value(&payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Failed to encode presence for '{}': {}", user, e);
                return;
            }
        };
        match handle.track(record).await {
            Ok(()) => tracing::info!("Presence tracked for '{}' on '{}'", user, handle.topic()),
            Err(e) => tracing::warn!("Presence track for '{}' failed: {}", user, e),
        }
    }
}
