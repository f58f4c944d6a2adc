//! Wiring for the gift bot: roster selection, transport, tracker, scheduler
//! and update poller, plus the shutdown sequence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;

use gift_common::config::AppConfig;
use gift_common::db;
use gift_common::traits::{RosterStore, Transport};
use gift_engine::{
    DeliveryPolicy, NotificationTracker, Scheduler, SchedulerSettings, SystemClock,
    UpdateDispatcher, UpdatePoller,
};
use gift_notifier::{TelegramConfig, TelegramTransport};
use gift_roster::{JsonRosterStore, PgRosterStore};

/// Open the roster: Postgres when `DATABASE_URL` is set, the JSON file otherwise.
pub async fn open_roster(config: &AppConfig) -> anyhow::Result<Arc<dyn RosterStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::create_pool(url, config.db_max_connections).await?;
            let store = PgRosterStore::new(pool);
            store.migrate().await?;
            tracing::info!("Using Postgres roster");
            Ok(Arc::new(store))
        }
        None => {
            let store = JsonRosterStore::load(&config.roster_path)
                .await
                .with_context(|| format!("loading roster from {}", config.roster_path))?;
            Ok(Arc::new(store))
        }
    }
}

pub fn delivery_policy(config: &AppConfig) -> anyhow::Result<DeliveryPolicy> {
    if config.max_attempts == 0 {
        anyhow::bail!("MAX_ATTEMPTS must be at least 1");
    }
    let secs = i64::try_from(config.min_attempt_interval_secs)
        .context("MIN_ATTEMPT_INTERVAL_SECS is too large")?;
    let min_interval = chrono::Duration::try_seconds(secs)
        .context("MIN_ATTEMPT_INTERVAL_SECS is too large")?;

    Ok(DeliveryPolicy {
        max_attempts: config.max_attempts,
        min_interval,
    })
}

pub fn scheduler_settings(config: &AppConfig) -> anyhow::Result<SchedulerSettings> {
    if config.tick_interval_secs == 0 {
        anyhow::bail!("TICK_INTERVAL_SECS must be at least 1");
    }
    Ok(SchedulerSettings {
        tick_interval: Duration::from_secs(config.tick_interval_secs),
        retention: chrono::Duration::days(i64::from(config.notification_retention_days)),
    })
}

pub fn telegram_config(config: &AppConfig) -> TelegramConfig {
    TelegramConfig {
        bot_token: config.telegram_bot_token.clone(),
        api_url: config.telegram_api_url.clone(),
        request_timeout: Duration::from_secs(config.request_timeout_secs),
    }
}

/// Run the bot until Ctrl+C.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let policy = delivery_policy(&config)?;
    let settings = scheduler_settings(&config)?;
    let roster = open_roster(&config).await?;

    let transport: Arc<dyn Transport> =
        Arc::new(TelegramTransport::new(telegram_config(&config)));
    if let Err(e) = transport.remove_stale_subscription().await {
        tracing::warn!(error = %e, "Could not remove webhook, polling may conflict");
    }

    let tracker = NotificationTracker::shared(policy);
    let clock = Arc::new(SystemClock::new(config.reference_offset));

    let dispatcher = UpdateDispatcher::new(roster.clone(), transport.clone(), tracker.clone());
    let mut poller = UpdatePoller::new(transport.clone(), dispatcher, config.poll_timeout_secs);
    poller.drain_backlog().await;

    let scheduler = Scheduler::new(roster, transport, tracker, clock, settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_rx = shutdown_rx.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_rx).await });
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    tracing::info!(
        reference_offset = %config.reference_offset,
        max_attempts = policy.max_attempts,
        "Gift bot running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    // Receivers outlive the send; both tasks are still running here.
    let _ = shutdown_tx.send(true);
    scheduler_task.await.context("scheduler task panicked")?;
    poller_task.await.context("update poller task panicked")?;

    Ok(())
}
