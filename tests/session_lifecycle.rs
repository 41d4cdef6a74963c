// Session Lifecycle Tests
//
// Login, logout and relogin flows driven through the manager against the
// in-memory realtime service.

use salesdesk::{
    ChannelEvent, ChannelStatus, InMemoryTransport, LoginIdentity, Permissions, PresenceEvent,
    RealtimeConfig, RealtimeTransport, Role, Session, SessionChannelManager, SessionPhase,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const PRESENCE: &str = "online-users";
const CHAT: &str = "public:chat_messages:app";

fn config() -> RealtimeConfig {
    RealtimeConfig {
        join_resync_delay_ms: 40,
        ..RealtimeConfig::default()
    }
}

fn setup() -> (Arc<InMemoryTransport>, Arc<SessionChannelManager>) {
    let transport = Arc::new(InMemoryTransport::new());
    let manager = Arc::new(SessionChannelManager::new(transport.clone(), config()));
    (transport, manager)
}

fn record(user: &str) -> serde_json::Value {
    json!({ "online_at": "2026-10-15T09:00:00Z", "user_name": user, "team": "south" })
}

async fn roster_keys(manager: &SessionChannelManager) -> Vec<String> {
    manager.roster().await.into_iter().map(|r| r.key).collect()
}

async fn wait_for_roster(manager: &SessionChannelManager, expected: &[&str]) -> bool {
    for _ in 0..100 {
        if roster_keys(manager).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_unread(manager: &SessionChannelManager, count: u64) -> bool {
    for _ in 0..100 {
        if manager.unread().await.unread() == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_notifications_subscribed(manager: &SessionChannelManager) {
    for _ in 0..100 {
        if let Some(channel) = manager.notification_channel().await {
            if channel.status() == ChannelStatus::Subscribed {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("notification channel never subscribed");
}

fn admin(name: &str) -> Session {
    Session::new(name, Role::Admin)
}

#[tokio::test]
async fn test_standard_login_announces_and_logout_releases() {
    let (transport, manager) = setup();
    let ana = Session::from_identity(
        LoginIdentity {
            username: Some("ana".to_string()),
            ..LoginIdentity::default()
        },
        "unknown",
    );

    manager.begin_session(ana).await;
    assert!(manager.notification_channel().await.is_none());
    assert!(wait_for_roster(&manager, &["ana"]).await);

    let table = transport.presence_state(PRESENCE).await.unwrap();
    assert_eq!(table["ana"][0]["user_name"], "ana");
    assert_eq!(table["ana"][0]["team"], "unassigned");
    assert_eq!(transport.live_subscriptions(CHAT).await, 0);

    manager.end_session().await.unwrap();
    assert!(manager.roster().await.is_empty());
    assert_eq!(transport.total_subscriptions().await, 0);
    assert!(transport.presence_state(PRESENCE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_admin_unread_signal() {
    let (transport, manager) = setup();
    manager.begin_session(admin("bruno")).await;
    wait_notifications_subscribed(&manager).await;

    transport
        .insert_row("chat_messages", json!({ "sender": "carla", "body": "oi" }))
        .await;
    assert!(wait_for_unread(&manager, 1).await);
    assert!(manager.has_unread().await);

    transport
        .insert_row("chat_messages", json!({ "sender": "bruno", "body": "ok" }))
        .await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(manager.unread().await.unread(), 1);

    manager.mark_seen().await;
    assert!(!manager.has_unread().await);

    manager.end_session().await.unwrap();
    assert!(!manager.has_unread().await);
}

#[tokio::test]
async fn test_notification_channel_only_for_eligible_sessions() {
    let (transport, manager) = setup();
    let standard_with_chat = Session::new("dora", Role::Standard).with_permissions(Permissions {
        can_view_supervisor_chat: true,
        ..Permissions::default()
    });
    let supervisor: LoginIdentity = serde_json::from_value(json!({
        "username": "sid",
        "role": "supervisor"
    }))
    .unwrap();
    let cases = [
        (Session::new("ana", Role::Standard), false),
        (Session::from_identity(supervisor, "unknown"), true),
        (standard_with_chat, true),
        (admin("bruno"), true),
    ];

    for (session, eligible) in cases {
        manager.begin_session(session.clone()).await;
        assert_eq!(
            manager.notification_channel().await.is_some(),
            eligible,
            "{}",
            session
        );
        manager.end_session().await.unwrap();
    }
    assert_eq!(transport.total_subscriptions().await, 0);
}

#[tokio::test]
async fn test_late_join_within_delay_window() {
    let (transport, manager) = setup();
    manager.begin_session(Session::new("ana", Role::Standard)).await;
    assert!(wait_for_roster(&manager, &["ana"]).await);

    // The join is reported before dora's record becomes readable.
    transport
        .emit(
            PRESENCE,
            ChannelEvent::Presence(PresenceEvent::Join {
                key: "dora".to_string(),
                records: vec![record("dora")],
            }),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    transport.put_presence(PRESENCE, "dora", record("dora")).await;

    assert!(wait_for_roster(&manager, &["ana", "dora"]).await);
    manager.end_session().await.unwrap();
}

#[tokio::test]
async fn test_roster_independent_of_event_order() {
    let (transport, manager) = setup();
    manager.begin_session(Session::new("ana", Role::Standard)).await;
    assert!(wait_for_roster(&manager, &["ana"]).await);

    let sync = || ChannelEvent::Presence(PresenceEvent::Sync);
    let join = |key: &str| {
        ChannelEvent::Presence(PresenceEvent::Join {
            key: key.to_string(),
            records: vec![],
        })
    };
    let leave = |key: &str| {
        ChannelEvent::Presence(PresenceEvent::Leave {
            key: key.to_string(),
            records: vec![],
        })
    };
    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for order in orders {
        // Table content: ana plus carla; eli has just left.
        transport.put_presence(PRESENCE, "carla", record("carla")).await;
        transport.remove_presence(PRESENCE, "eli").await;

        for index in order {
            let event = match index {
                0 => sync(),
                1 => join("carla"),
                _ => leave("eli"),
            };
            transport.emit(PRESENCE, event).await;
        }
        assert!(
            wait_for_roster(&manager, &["ana", "carla"]).await,
            "order {:?}",
            order
        );

        // Swap carla for eli before the next round.
        transport.remove_presence(PRESENCE, "carla").await;
        transport.put_presence(PRESENCE, "eli", record("eli")).await;
        transport.emit(PRESENCE, sync()).await;
        assert!(wait_for_roster(&manager, &["ana", "eli"]).await);
    }

    manager.end_session().await.unwrap();
}

#[tokio::test]
async fn test_rapid_relogin_keeps_one_channel_per_topic() {
    let (transport, manager) = setup();
    for round in 0..5 {
        manager.begin_session(admin(&format!("user{}", round))).await;
        assert!(transport.live_subscriptions(PRESENCE).await <= 1);
        assert!(transport.live_subscriptions(CHAT).await <= 1);
    }
    assert_eq!(manager.open_channel_count().await, 2);
    assert!(wait_for_roster(&manager, &["user4"]).await);
    assert_eq!(transport.live_subscriptions(PRESENCE).await, 1);
    assert_eq!(transport.live_subscriptions(CHAT).await, 1);

    manager.end_session().await.unwrap();
    assert_eq!(transport.total_subscriptions().await, 0);
}

#[tokio::test]
async fn test_concurrent_transitions_leave_single_session() {
    let (transport, manager) = setup();
    let (_, _, _) = tokio::join!(
        manager.begin_session(admin("ana")),
        manager.end_session(),
        manager.begin_session(admin("bruno")),
    );

    assert!(transport.live_subscriptions(PRESENCE).await <= 1);
    assert!(transport.live_subscriptions(CHAT).await <= 1);
    assert!(manager.open_channel_count().await <= 2);

    manager.end_session().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.total_subscriptions().await, 0);
}

#[tokio::test]
async fn test_logout_while_connecting() {
    let (transport, manager) = setup();
    transport.hold_acknowledgements();

    manager.begin_session(admin("bruno")).await;
    let presence = manager.presence_channel().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(presence.status(), ChannelStatus::Connecting);
    assert!(manager.roster().await.is_empty());

    manager.end_session().await.unwrap();
    assert_eq!(presence.status(), ChannelStatus::Closed);

    transport.release_acknowledgements();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.total_subscriptions().await, 0);
    assert!(transport.presence_state(PRESENCE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_release_is_retried_on_next_login() {
    let (transport, manager) = setup();
    manager.begin_session(Session::new("ana", Role::Standard)).await;
    assert!(wait_for_roster(&manager, &["ana"]).await);

    transport.fail_next_unsubscribe();
    assert!(manager.end_session().await.is_err());
    assert!(manager.roster().await.is_empty());
    assert_eq!(transport.live_subscriptions(PRESENCE).await, 1);

    manager.begin_session(Session::new("bruno", Role::Standard)).await;
    assert!(wait_for_roster(&manager, &["bruno"]).await);
    let table = transport.presence_state(PRESENCE).await.unwrap();
    assert!(!table.contains_key("ana"));
    assert_eq!(transport.total_subscriptions().await, 1);
    assert_eq!(manager.open_channel_count().await, 1);

    manager.end_session().await.unwrap();
    assert_eq!(transport.total_subscriptions().await, 0);
}

#[tokio::test]
async fn test_record_without_name_does_not_freeze_roster() {
    let (transport, manager) = setup();
    transport
        .put_presence(PRESENCE, "ghost", json!({ "equipe": "north" }))
        .await;
    manager.begin_session(Session::new("ana", Role::Standard)).await;
    assert!(wait_for_roster(&manager, &["ana", "ghost"]).await);

    let roster = manager.roster().await;
    assert_eq!(roster[1].user_name, "unknown");
    assert_eq!(roster[1].team.as_deref(), Some("north"));
    manager.end_session().await.unwrap();
}

#[tokio::test]
async fn test_watch_sessions_follows_provider() {
    let (transport, manager) = setup();
    let (sessions, provider) = watch::channel(None);
    let watcher = manager.clone().watch_sessions(provider);

    sessions.send_replace(Some(Session::new("ana", Role::Standard)));
    assert!(wait_for_roster(&manager, &["ana"]).await);
    assert_eq!(manager.phase().await, SessionPhase::SessionActive);

    sessions.send_replace(Some(admin("bruno")));
    assert!(wait_for_roster(&manager, &["bruno"]).await);
    assert!(manager.notification_channel().await.is_some());

    sessions.send_replace(None);
    assert!(wait_for_roster(&manager, &[]).await);

    sessions.send_replace(Some(admin("carla")));
    assert!(wait_for_roster(&manager, &["carla"]).await);

    // Dropping the provider ends the session.
    drop(sessions);
    watcher.await.unwrap();
    assert_eq!(manager.phase().await, SessionPhase::NoSession);
    assert_eq!(transport.total_subscriptions().await, 0);
}
