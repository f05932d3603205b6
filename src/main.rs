//! Notiflow - command-line notification watcher
//!
//! Connects to a notification server with the settings from the
//! `NOTIFLOW_*` environment variables and logs everything it receives
//! until interrupted.

use anyhow::Context;
use notiflow_client::{ConnectionManager, ManagerConfig, NetworkMonitor, StaticAuth};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notiflow=info,notiflow_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ManagerConfig::from_env().context("invalid NOTIFLOW_* configuration")?;
    let user_id = std::env::var("NOTIFLOW_USER_ID").context("NOTIFLOW_USER_ID is not set")?;
    let token = std::env::var("NOTIFLOW_TOKEN").context("NOTIFLOW_TOKEN is not set")?;

    let network = NetworkMonitor::new();
    let manager = ConnectionManager::new(
        config,
        StaticAuth::new(user_id.clone(), token),
        network.clone(),
    )?;

    manager.set_notification_handler(|n| {
        tracing::info!(id = %n.id, level = ?n.level, "{}: {}", n.title, n.message);
    });
    manager.set_update_handler(|id, kind| {
        tracing::info!(id, "notification {}", kind);
    });
    manager.set_connection_status_handler(|connected| {
        if connected {
            tracing::info!("connected");
        } else {
            tracing::info!("disconnected");
        }
    });
    manager.set_error_handler(|error| {
        tracing::error!(kind = ?error.kind(), "connection failed: {}", error);
    });

    tracing::info!("Watching notifications for user {}", user_id);
    manager.connect(user_id).await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("Shutting down");
    network.page_hide();
    manager.destroy().await;
    Ok(())
}
