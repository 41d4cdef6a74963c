mod cli;

use anyhow::Context;
use clap::Parser;
use salesdesk::channel::PresencePayload;
use salesdesk::{
    InMemoryTransport, LoginIdentity, RealtimeConfig, Role, Session, SessionChannelManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("salesdesk=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Some(Commands::ConfigSample { output }) = &cli.command {
        let path = output
            .clone()
            .unwrap_or_else(|| PathBuf::from("./salesdesk.sample.yaml"));
        RealtimeConfig::sample()
            .save(&path)
            .with_context(|| format!("writing sample config to {:?}", path))?;
        println!("Sample config written: {:?}", path);
        return Ok(());
    }

    let mut config = RealtimeConfig::load(cli.config_path.as_deref())?;

    match cli.command {
        Some(Commands::Demo { join_delay_ms }) => {
            if let Some(delay) = join_delay_ms {
                config.join_resync_delay_ms = delay;
            }
            run_demo(config).await
        }
        Some(Commands::ConfigSample { .. }) => Ok(()),
        None => run_demo(config).await,
    }
}

async fn run_demo(config: RealtimeConfig) -> anyhow::Result<()> {
    let settle = config.join_resync_delay() + Duration::from_millis(100);
    let transport = Arc::new(InMemoryTransport::new());
    let manager = Arc::new(SessionChannelManager::new(transport.clone(), config.clone()));

    // A colleague already online on another device.
    let colleague = PresencePayload {
        online_at: Some(chrono::Utc::now()),
        user_name: Some("carla".to_string()),
        team: Some("south".to_string()),
    };
    transport
        .put_presence(&config.presence_topic, "carla", serde_json::to_value(&colleague)?)
        .await;

    let (sessions, provider) = watch::channel(None);
    let watcher = manager.clone().watch_sessions(provider);

    let ana = Session::from_identity(
        LoginIdentity {
            username: Some("ana".to_string()),
            team: Some("north".to_string()),
            ..LoginIdentity::default()
        },
        &config.unknown_user_label,
    );
    info!("Logging in {}", ana);
    sessions.send_replace(Some(ana));
    tokio::time::sleep(settle).await;
    print_state(&manager).await;

    let bruno = Session::new("bruno", Role::Admin);
    info!("Switching to {}", bruno);
    sessions.send_replace(Some(bruno));
    tokio::time::sleep(settle).await;

    transport
        .insert_row(
            &config.notification_table,
            serde_json::json!({ "sender": "carla", "body": "status report is up" }),
        )
        .await;
    transport
        .insert_row(
            &config.notification_table,
            serde_json::json!({ "sender": "bruno", "body": "thanks" }),
        )
        .await;
    tokio::time::sleep(settle).await;
    print_state(&manager).await;

    info!("Opening chat view");
    manager.mark_seen().await;
    print_state(&manager).await;

    info!("Logging out");
    sessions.send_replace(None);
    tokio::time::sleep(settle).await;
    print_state(&manager).await;

    drop(sessions);
    watcher.await?;
    println!(
        "Live subscriptions after shutdown: {}",
        transport.total_subscriptions().await
    );
    Ok(())
}

async fn print_state(manager: &SessionChannelManager) {
    let session = manager
        .session()
        .await
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("Session: {}", session);

    let roster = manager.roster().await;
    println!("Active users ({}):", roster.len());
    for user in roster {
        println!(
            "  • {} ({})",
            user.user_name,
            user.team.as_deref().unwrap_or("no team")
        );
    }

    let unread = manager.unread().await;
    println!(
        "Unread messages: {} (has unread: {})",
        unread.unread(),
        unread.has_unread()
    );
    println!();
}
