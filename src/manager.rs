// Session Channel Manager
//
// Sole owner of channel lifecycle. Opens one presence channel and, when the
// session qualifies, one notification channel per active session, and tears
// both down when the session ends or changes.

use crate::channel::{
    ChannelHandle, ChannelStatus, GenerationCounter, NotificationChannel, PresenceChannel,
    PresenceRecord, UnreadState,
};
use crate::config::RealtimeConfig;
use crate::error::TeardownError;
use crate::session::Session;
use crate::transport::RealtimeTransport;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Lifecycle phase of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    NoSession,
    SessionActive,
}

struct ActiveSession {
    session: Session,
    presence: Arc<PresenceChannel>,
    notifications: Option<Arc<NotificationChannel>>,
}

/// Session-scoped channel manager
pub struct SessionChannelManager {
    transport: Arc<dyn RealtimeTransport>,
    config: RealtimeConfig,
    generations: GenerationCounter,
    /// Every handle opened since the last sweep. Holding this lock serializes
    /// transitions.
    ledger: Mutex<Vec<Arc<ChannelHandle>>>,
    active: RwLock<Option<Arc<ActiveSession>>>,
}

impl SessionChannelManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: RealtimeConfig) -> Self {
        Self {
            transport,
            config,
            generations: GenerationCounter::new(),
            ledger: Mutex::new(Vec::new()),
            active: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Current generation; advances on every transition
    pub fn generation(&self) -> u64 {
        self.generations.current().value()
    }

    /// NoSession/SessionActive -> SessionActive.
    ///
    /// Everything still open is closed first, then fresh channels are opened
    /// for `session`. Close failures of the previous channels are logged and
    /// do not stop the activation.
    pub async fn begin_session(&self, session: Session) {
        let mut ledger = self.ledger.lock().await;
        let generation = self.generations.advance();
        tracing::info!(
            "Activating channels for {} (generation {})",
            session,
            generation.value()
        );

        if let Err(e) = self.teardown(&mut ledger).await {
            tracing::warn!("Previous channels closed with errors: {}", e);
        }

        let presence = Arc::new(
            PresenceChannel::open(
                self.transport.clone(),
                &self.config,
                &session,
                generation.clone(),
            )
            .await,
        );
        ledger.push(presence.handle().clone());

        let notifications =
            NotificationChannel::open(self.transport.clone(), &self.config, &session, generation)
                .await
                .map(Arc::new);
        if let Some(channel) = &notifications {
            ledger.push(channel.handle().clone());
        }

        *self.active.write().await = Some(Arc::new(ActiveSession {
            session,
            presence,
            notifications,
        }));
        tracing::info!("Realtime channels initialized ({} open)", ledger.len());
    }

    /// SessionActive -> NoSession.
    ///
    /// Returns once both channels are closed and the roster and unread signal
    /// are empty. Close failures are returned only after local state has been
    /// reset.
    pub async fn end_session(&self) -> Result<(), TeardownError> {
        let mut ledger = self.ledger.lock().await;
        self.generations.advance();
        let result = self.teardown(&mut ledger).await;
        match &result {
            Ok(()) => tracing::info!("Session channels closed"),
            Err(e) => tracing::warn!("Session channels closed with errors: {}", e),
        }
        result
    }

    /// React to a value from the session provider.
    ///
    /// A repeat of the active session is ignored; a different session is a
    /// full close and reopen; `None` ends the session.
    pub async fn apply(&self, session: Option<Session>) -> Result<(), TeardownError> {
        match session {
            Some(session) => {
                if self.session().await.as_ref() == Some(&session) {
                    tracing::debug!("Session {} unchanged, keeping channels", session);
                    return Ok(());
                }
                self.begin_session(session).await;
                Ok(())
            }
            None => self.end_session().await,
        }
    }

    /// Follow a session provider until it goes away, then end the session
    pub fn watch_sessions(
        self: Arc<Self>,
        mut sessions: watch::Receiver<Option<Session>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let session = sessions.borrow_and_update().clone();
                if let Err(e) = self.apply(session).await {
                    tracing::error!("Session teardown failed: {}", e);
                }
                if sessions.changed().await.is_err() {
                    break;
                }
            }

            tracing::debug!("Session provider closed");
            if let Err(e) = self.end_session().await {
                tracing::error!("Session teardown failed: {}", e);
            }
        })
    }

    async fn teardown(&self, ledger: &mut Vec<Arc<ChannelHandle>>) -> Result<(), TeardownError> {
        let previous = self.active.write().await.take();
        let mut failures = Vec::new();

        let mut current: Vec<&Arc<ChannelHandle>> = Vec::new();
        if let Some(active) = &previous {
            current.push(active.presence.handle());
            if let Some(channel) = &active.notifications {
                current.push(channel.handle());
            }
        }

        // Handles left unreleased by an earlier teardown get another attempt.
        for handle in ledger.iter() {
            let leftover = !current.iter().any(|c| Arc::ptr_eq(c, handle));
            if leftover && handle.status() != ChannelStatus::Closed {
                tracing::warn!(
                    "Sweeping leftover channel '{}' from generation {}",
                    handle.topic(),
                    handle.generation().value()
                );
                if let Err(e) = handle.close().await {
                    failures.push(e);
                }
            }
        }

        if let Some(active) = &previous {
            let notifications = async {
                match &active.notifications {
                    Some(channel) => channel.close().await,
                    None => Ok(()),
                }
            };
            let (presence, notifications) = tokio::join!(active.presence.close(), notifications);
            failures.extend(presence.err());
            failures.extend(notifications.err());
        }

        ledger.retain(|handle| handle.status() != ChannelStatus::Closed);
        if !ledger.is_empty() {
            tracing::warn!("{} channel(s) still awaiting release", ledger.len());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        if self.active.read().await.is_some() {
            SessionPhase::SessionActive
        } else {
            SessionPhase::NoSession
        }
    }

    pub async fn session(&self) -> Option<Session> {
        self.active.read().await.as_ref().map(|a| a.session.clone())
    }

    pub async fn presence_channel(&self) -> Option<Arc<PresenceChannel>> {
        self.active.read().await.as_ref().map(|a| a.presence.clone())
    }

    pub async fn notification_channel(&self) -> Option<Arc<NotificationChannel>> {
        self.active
            .read()
            .await
            .as_ref()
            .and_then(|a| a.notifications.clone())
    }

    /// Active users, ordered by key. Empty without a session.
    pub async fn roster(&self) -> Vec<PresenceRecord> {
        self.presence_channel()
            .await
            .map(|p| p.snapshot())
            .unwrap_or_default()
    }

    pub async fn unread(&self) -> UnreadState {
        self.notification_channel()
            .await
            .map(|n| n.unread())
            .unwrap_or_default()
    }

    pub async fn has_unread(&self) -> bool {
        self.unread().await.has_unread()
    }

    pub async fn unread_count(&self) -> u64 {
        self.unread().await.unread()
    }

    pub async fn mark_seen(&self) {
        if let Some(channel) = self.notification_channel().await {
            channel.mark_seen();
        }
    }

    /// Handles opened by this manager that are not closed yet
    pub async fn open_channel_count(&self) -> usize {
        self.ledger
            .lock()
            .await
            .iter()
            .filter(|h| h.status() != ChannelStatus::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use crate::transport::InMemoryTransport;
    use std::time::Duration;

    fn manager(transport: &Arc<InMemoryTransport>) -> SessionChannelManager {
        SessionChannelManager::new(transport.clone(), RealtimeConfig::default())
    }

    #[tokio::test]
    async fn test_initial_phase_is_no_session() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(&transport);
        assert_eq!(manager.phase().await, SessionPhase::NoSession);
        assert!(manager.roster().await.is_empty());
        assert!(!manager.has_unread().await);
        assert!(manager.end_session().await.is_ok());
    }

    #[tokio::test]
    async fn test_begin_and_end_session() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(&transport);

        manager.begin_session(Session::new("bruno", Role::Admin)).await;
        assert_eq!(manager.phase().await, SessionPhase::SessionActive);
        assert!(manager.presence_channel().await.is_some());
        assert!(manager.notification_channel().await.is_some());
        assert_eq!(manager.open_channel_count().await, 2);

        manager.end_session().await.unwrap();
        assert_eq!(manager.phase().await, SessionPhase::NoSession);
        assert!(manager.presence_channel().await.is_none());
        assert_eq!(manager.open_channel_count().await, 0);
        assert_eq!(transport.total_subscriptions().await, 0);
    }

    #[tokio::test]
    async fn test_generation_advances_on_every_transition() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(&transport);
        let start = manager.generation();

        manager.begin_session(Session::new("ana", Role::Standard)).await;
        let first = manager.presence_channel().await.unwrap().generation();
        manager.begin_session(Session::new("bruno", Role::Standard)).await;
        let second = manager.presence_channel().await.unwrap().generation();
        manager.end_session().await.unwrap();

        assert!(first > start);
        assert!(second > first);
        assert!(manager.generation() > second);
    }

    #[tokio::test]
    async fn test_apply_ignores_repeated_session() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(&transport);
        let session = Session::new("ana", Role::Standard);

        manager.apply(Some(session.clone())).await.unwrap();
        let generation = manager.generation();
        manager.apply(Some(session)).await.unwrap();
        assert_eq!(manager.generation(), generation);

        manager.apply(None).await.unwrap();
        assert_eq!(manager.phase().await, SessionPhase::NoSession);
    }

    #[tokio::test]
    async fn test_teardown_failure_resets_state_and_retries_release() {
        let transport = Arc::new(InMemoryTransport::new());
        let manager = manager(&transport);
        manager.begin_session(Session::new("ana", Role::Standard)).await;
        let presence = manager.presence_channel().await.unwrap();
        for _ in 0..100 {
            if presence.status() == ChannelStatus::Subscribed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        transport.fail_next_unsubscribe();
        let err = manager.end_session().await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(manager.phase().await, SessionPhase::NoSession);
        assert!(manager.roster().await.is_empty());
        assert!(presence.snapshot().is_empty());
        assert_eq!(presence.status(), ChannelStatus::Closing);
        assert_eq!(manager.open_channel_count().await, 1);
        assert_eq!(transport.total_subscriptions().await, 1);

        manager.end_session().await.unwrap();
        assert_eq!(presence.status(), ChannelStatus::Closed);
        assert_eq!(manager.open_channel_count().await, 0);
        assert_eq!(transport.total_subscriptions().await, 0);
    }
}
