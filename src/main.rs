use std::sync::Arc;

use anyhow::Context;

use jin::clock::{Clock, TokioClock};
use jin::config::AppConfig;
use jin::routines::engine::{self, ReminderEngine};
use jin::routines::notifications::NotificationManager;
use jin::routines::ws::{AppState, routine_routes};
use jin::store::{LibSqlStore, RoutineStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("JIN v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Routine API: http://0.0.0.0:{}/api/routines", config.port);
    eprintln!("   Notification WS: ws://0.0.0.0:{}/ws", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn RoutineStore> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Notifications & reminders ───────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let notifications = NotificationManager::new(config.notifications.clone(), clock.clone());
    let reminder_engine = Arc::new(ReminderEngine::new(
        config.reminders.clone(),
        store.clone(),
        notifications.clone(),
    ));

    let _ticker = if config.reminders.enabled {
        eprintln!(
            "   Reminders: every {}s for {:?}",
            config.reminders.interval.as_secs(),
            config.reminders.user_ids
        );
        Some(engine::spawn_reminder_ticker(Arc::clone(&reminder_engine)))
    } else {
        eprintln!("   Reminders: disabled");
        None
    };

    // ── HTTP + WebSocket server ─────────────────────────────────────────
    let app = routine_routes(AppState::new(store, clock, reminder_engine));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(port = config.port, "Routine server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    notifications.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
