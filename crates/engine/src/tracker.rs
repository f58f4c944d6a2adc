//! Notification tracker: the per-reminder delivery state machine.
//!
//! Every (recipient, event owner) pair gets a record the first time a reminder
//! is successfully delivered. The record caps the number of attempts, spaces
//! them out by a minimum interval and stops everything once the recipient
//! confirms the transfer.
//!
//! ```text
//! Unseen ──send ok──▶ Pending ──send ok (attempts == max)──▶ Exhausted
//!                        │                                       │
//!                        └──────────── ack ──▶ Confirmed ◀── ack ─┘
//! ```
//!
//! State lives in memory only: a restart forgets every record, so reminders
//! that were pending start again from zero attempts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate};

use gift_common::types::NotificationKey;

/// Default number of delivery attempts per reminder.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default spacing between two attempts for the same reminder (2 hours).
pub const DEFAULT_MIN_INTERVAL_SECS: i64 = 2 * 60 * 60;

/// Tracker shared between the scheduler and the update dispatcher.
pub type SharedTracker = Arc<tokio::sync::Mutex<NotificationTracker>>;

/// Retry limits applied to every reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub min_interval: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_interval: Duration::seconds(DEFAULT_MIN_INTERVAL_SECS),
        }
    }
}

/// Delivery state of one reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    /// Successful sends so far; never exceeds the policy's `max_attempts`.
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<FixedOffset>>,
    /// Once set, never cleared.
    pub confirmed: bool,
    /// Reference-zone date the record was created on; drives [`NotificationTracker::gc`].
    pub cycle: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
    Unseen,
    Pending,
    Exhausted,
    Confirmed,
}

/// Result of [`NotificationTracker::record_confirmation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    AlreadyConfirmed,
    /// No reminder was ever delivered for this key.
    UnknownKey,
}

/// In-memory table of reminder records.
#[derive(Debug)]
pub struct NotificationTracker {
    policy: DeliveryPolicy,
    records: HashMap<NotificationKey, NotificationRecord>,
    /// Keys with a send currently on the wire.
    in_flight: HashSet<NotificationKey>,
}

impl NotificationTracker {
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    /// Wrap a fresh tracker for sharing between tasks.
    pub fn shared(policy: DeliveryPolicy) -> SharedTracker {
        Arc::new(tokio::sync::Mutex::new(Self::new(policy)))
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Whether a reminder for `key` may be sent at `now`.
    pub fn should_attempt(&self, key: &NotificationKey, now: DateTime<FixedOffset>) -> bool {
        let Some(record) = self.records.get(key) else {
            return true;
        };

        if record.confirmed || record.attempts >= self.policy.max_attempts {
            return false;
        }

        match record.last_attempt_at {
            Some(last) => now - last >= self.policy.min_interval,
            None => true,
        }
    }

    /// Count a successful send. Call only after `should_attempt` allowed it.
    pub fn record_attempt(&mut self, key: NotificationKey, now: DateTime<FixedOffset>) {
        let max_attempts = self.policy.max_attempts;
        let record = self
            .records
            .entry(key)
            .or_insert_with(|| NotificationRecord {
                attempts: 0,
                last_attempt_at: None,
                confirmed: false,
                cycle: now.date_naive(),
            });

        if record.attempts >= max_attempts {
            tracing::warn!(key = %key, attempts = record.attempts, "Attempt recorded past the cap, ignoring");
            return;
        }

        record.attempts += 1;
        record.last_attempt_at = Some(now);
    }

    /// Mark the reminder as acknowledged by its recipient. Idempotent.
    pub fn record_confirmation(&mut self, key: NotificationKey) -> ConfirmOutcome {
        match self.records.get_mut(&key) {
            Some(record) if record.confirmed => ConfirmOutcome::AlreadyConfirmed,
            Some(record) => {
                record.confirmed = true;
                ConfirmOutcome::Confirmed
            }
            None => ConfirmOutcome::UnknownKey,
        }
    }

    /// Check eligibility and reserve the key in one step.
    ///
    /// Returns `false` if the key is not eligible or another send for it is
    /// already on the wire. A `true` must be paired with [`Self::finish_attempt`].
    pub fn begin_attempt(&mut self, key: NotificationKey, now: DateTime<FixedOffset>) -> bool {
        if self.in_flight.contains(&key) || !self.should_attempt(&key, now) {
            return false;
        }
        self.in_flight.insert(key);
        true
    }

    /// Release a reservation; counts the attempt only if the send went through.
    pub fn finish_attempt(&mut self, key: NotificationKey, now: DateTime<FixedOffset>, delivered: bool) {
        self.in_flight.remove(&key);
        if delivered {
            self.record_attempt(key, now);
        }
    }

    /// Drop records created more than `retention` before `now`'s date.
    /// Returns how many were removed.
    pub fn gc(&mut self, now: DateTime<FixedOffset>, retention: Duration) -> usize {
        let today = now.date_naive();
        let before = self.records.len();
        let in_flight = &self.in_flight;
        self.records.retain(|key, record| {
            in_flight.contains(key) || today.signed_duration_since(record.cycle) <= retention
        });
        before - self.records.len()
    }

    pub fn state(&self, key: &NotificationKey) -> NotificationState {
        match self.records.get(key) {
            None => NotificationState::Unseen,
            Some(r) if r.confirmed => NotificationState::Confirmed,
            Some(r) if r.attempts >= self.policy.max_attempts => NotificationState::Exhausted,
            Some(_) => NotificationState::Pending,
        }
    }

    pub fn record(&self, key: &NotificationKey) -> Option<&NotificationRecord> {
        self.records.get(key)
    }

    /// Number of tracked reminders (for monitoring).
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }
}

impl Default for NotificationTracker {
    fn default() -> Self {
        Self::new(DeliveryPolicy::default())
    }
}
