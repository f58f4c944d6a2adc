//! Scheduler loop: periodic scan of the roster for birthdays that are due.
//!
//! Each tick:
//! 1. Takes "now" from the clock (fixed reference zone)
//! 2. Snapshots the roster
//! 3. Picks entries whose day/month is today and whose trigger time has passed
//! 4. Fans out one delivery attempt per (event, registered recipient)
//! 5. Purges tracker records older than the retention window
//!
//! Ticks run inline in the loop, so a slow tick delays the next one instead
//! of overlapping with it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use gift_common::error::AppError;
use gift_common::traits::{RosterStore, Transport};
use gift_common::types::{Event, RosterEntry};

use crate::clock::Clock;
use crate::delivery::{DeliveryOutcome, ReminderDelivery};
use crate::tracker::SharedTracker;

/// Default scheduler period (1 minute).
const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;

/// Default tracker retention (records from yesterday are kept).
const DEFAULT_RETENTION_DAYS: i64 = 1;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// How long tracker records outlive the day they were created on.
    pub retention: chrono::Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            retention: chrono::Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }
}

/// Counters for one tick, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due_events: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub purged: usize,
}

pub struct Scheduler {
    roster: Arc<dyn RosterStore>,
    delivery: ReminderDelivery,
    tracker: SharedTracker,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        roster: Arc<dyn RosterStore>,
        transport: Arc<dyn Transport>,
        tracker: SharedTracker,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            roster,
            delivery: ReminderDelivery::new(transport, tracker.clone()),
            tracker,
            clock,
            settings,
        }
    }

    /// Run one scan. Only a roster read failure is reported as an error;
    /// individual delivery problems are counted in the report.
    pub async fn tick(&self) -> Result<TickReport, AppError> {
        let now = self.clock.now();
        let entries = self.roster.all().await?;
        let events = due_events(&entries, now);

        let mut report = TickReport {
            due_events: events.len(),
            ..TickReport::default()
        };

        let mut attempts = JoinSet::new();
        for event in events {
            let event = Arc::new(event);
            for recipient in recipients_for(&event, &entries) {
                let delivery = self.delivery.clone();
                let event = Arc::clone(&event);
                let recipient = recipient.clone();
                attempts.spawn(async move { delivery.attempt(&event, &recipient, now).await });
            }
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(DeliveryOutcome::Sent) => report.sent += 1,
                Ok(DeliveryOutcome::Skipped) => report.skipped += 1,
                Ok(DeliveryOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Delivery task aborted");
                    report.failed += 1;
                }
            }
        }

        report.purged = self.tracker.lock().await.gc(now, self.settings.retention);
        Ok(report)
    }

    /// Tick until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            tick_interval_secs = self.settings.tick_interval.as_secs(),
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if shutdown_requested(&shutdown) {
                break;
            }

            match self.tick().await {
                Ok(report) if report.due_events > 0 || report.purged > 0 => {
                    tracing::info!(
                        due_events = report.due_events,
                        sent = report.sent,
                        skipped = report.skipped,
                        failed = report.failed,
                        purged = report.purged,
                        "Scheduler tick complete"
                    );
                }
                Ok(_) => tracing::debug!("Scheduler tick: nothing due"),
                Err(e) => tracing::error!(error = %e, "Scheduler tick failed, roster unavailable"),
            }
        }

        tracing::info!("Scheduler stopped");
    }
}

/// Whether the shutdown channel has fired or lost its sender.
pub(crate) fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Entries whose birthday is today and whose trigger time has been reached.
///
/// Unregistered entries are skipped silently; unparseable trigger times are
/// skipped with a warning.
pub fn due_events(entries: &[RosterEntry], now: DateTime<FixedOffset>) -> Vec<Event> {
    let mut events = Vec::new();

    for entry in entries {
        if entry.notify_day != now.day() || entry.notify_month != now.month() {
            continue;
        }

        let Some(owner) = entry.user_id() else {
            tracing::debug!(entry_id = entry.id, name = %entry.name, "Birthday today but owner is unregistered");
            continue;
        };

        let trigger = match entry.trigger_time() {
            Ok(trigger) => trigger,
            Err(e) => {
                tracing::warn!(entry_id = entry.id, name = %entry.name, error = %e, "Skipping birthday");
                continue;
            }
        };

        if trigger.is_reached_at(now.time()) {
            events.push(Event::new(owner, trigger, entry));
        }
    }

    events
}

/// Registered entries other than the event owner.
pub fn recipients_for<'a>(
    event: &'a Event,
    entries: &'a [RosterEntry],
) -> impl Iterator<Item = &'a RosterEntry> + 'a {
    entries
        .iter()
        .filter(move |e| e.user_id().is_some_and(|id| id != event.owner))
}
