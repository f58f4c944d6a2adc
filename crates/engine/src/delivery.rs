//! Single reminder delivery.
//!
//! The tracker is consulted and reserved before the network call and updated
//! after it; the lock is never held while the transport is talking to the
//! remote endpoint.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};

use gift_common::traits::Transport;
use gift_common::types::{AckControl, Event, NotificationKey, RosterEntry};

use crate::tracker::SharedTracker;

/// What happened to one (event, recipient) pair on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Not eligible right now (confirmed, exhausted, too soon, in flight, unregistered).
    Skipped,
    /// The transport rejected or timed out; the attempt was not counted.
    Failed,
}

/// Sends reminders through a [`Transport`], gated by the shared tracker.
#[derive(Clone)]
pub struct ReminderDelivery {
    transport: Arc<dyn Transport>,
    tracker: SharedTracker,
}

impl ReminderDelivery {
    pub fn new(transport: Arc<dyn Transport>, tracker: SharedTracker) -> Self {
        Self { transport, tracker }
    }

    /// Try to remind `recipient` about `event`.
    pub async fn attempt(
        &self,
        event: &Event,
        recipient: &RosterEntry,
        now: DateTime<FixedOffset>,
    ) -> DeliveryOutcome {
        let Some(recipient_id) = recipient.user_id() else {
            return DeliveryOutcome::Skipped;
        };
        let key = NotificationKey::new(recipient_id, event.owner);

        if !self.tracker.lock().await.begin_attempt(key, now) {
            tracing::trace!(key = %key, "Reminder not eligible");
            return DeliveryOutcome::Skipped;
        }

        let text = compose_reminder(event, recipient);
        let control = AckControl::for_owner(event.owner);
        let result = self.transport.send(recipient_id, &text, Some(&control)).await;

        let attempts = {
            let mut tracker = self.tracker.lock().await;
            tracker.finish_attempt(key, now, result.is_ok());
            tracker.record(&key).map(|r| r.attempts).unwrap_or(0)
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    recipient = %recipient_id,
                    owner = %event.owner,
                    birthday_person = %event.display_name,
                    attempts,
                    "Reminder sent"
                );
                DeliveryOutcome::Sent
            }
            Err(e) => {
                tracing::warn!(
                    recipient = %recipient_id,
                    owner = %event.owner,
                    error = %e,
                    "Reminder delivery failed, will retry on a later tick"
                );
                DeliveryOutcome::Failed
            }
        }
    }
}

/// Render the reminder text.
///
/// The amount comes from the recipient's own row: different people may owe
/// different amounts for the same birthday.
pub fn compose_reminder(event: &Event, recipient: &RosterEntry) -> String {
    let amount = match recipient.amount {
        Some(amount) => amount.to_string(),
        None => {
            tracing::warn!(
                recipient = %recipient.name,
                entry_id = recipient.id,
                "Recipient has no amount configured"
            );
            "[amount not set]".to_string()
        }
    };

    let who = match event.owner_handle.as_deref() {
        Some(handle) if !handle.is_empty() => format!("{} ({})", event.display_name, handle),
        _ => event.display_name.clone(),
    };

    format!(
        "Hi!\n\
         {who} has a birthday on {date}. \
         Please transfer {amount} rubles today or tomorrow \
         to {collector} by phone {phone} at {bank} bank.\n\
         Press the button below once the transfer is done.",
        date = event.date_label,
        collector = event.funds.handle,
        phone = event.funds.phone,
        bank = event.funds.bank,
    )
}
