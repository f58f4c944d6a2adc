//! Update dispatcher: routes inbound transport events.
//!
//! Acknowledgment presses confirm the matching reminder in the tracker;
//! registration requests bind a chat identity to a roster row. The
//! [`UpdatePoller`] drives the long-poll loop that feeds the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use gift_common::traits::{RosterStore, Transport};
use gift_common::types::{InboundEvent, NotificationKey, UpdateBatch, UserId, normalize_handle};

use crate::scheduler::shutdown_requested;
use crate::tracker::{ConfirmOutcome, SharedTracker};

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Startup backlog drain: attempts, spacing, and the short poll timeout used.
const BACKLOG_DRAIN_ATTEMPTS: u32 = 3;
const BACKLOG_DRAIN_DELAY: Duration = Duration::from_secs(2);
const BACKLOG_POLL_TIMEOUT_SECS: u64 = 1;

/// How long an in-flight poll may keep running once shutdown is requested.
const SHUTDOWN_POLL_GRACE: Duration = Duration::from_secs(2);

const MSG_CONFIRMED: &str = "Thank you! Your transfer has been noted.";
const MSG_ALREADY_CONFIRMED: &str = "Your transfer has already been noted, thank you!";
const MSG_REGISTERED: &str = "Your ID and username have been saved to the roster.";
const MSG_ALREADY_REGISTERED: &str = "You are already registered and your details are up to date.";
const MSG_NOT_IN_ROSTER: &str = "You were not found in the roster.";
const MSG_REGISTRATION_FAILED: &str = "Could not update your registration, please try again later.";

/// How an inbound event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Confirmed,
    AlreadyConfirmed,
    /// Acknowledgment for a reminder the tracker has never delivered.
    UnknownReminder,
    Registered,
    AlreadyRegistered,
    NotInRoster,
    RegistrationFailed,
    IgnoredControl,
}

#[derive(Clone)]
pub struct UpdateDispatcher {
    roster: Arc<dyn RosterStore>,
    transport: Arc<dyn Transport>,
    tracker: SharedTracker,
}

impl UpdateDispatcher {
    pub fn new(
        roster: Arc<dyn RosterStore>,
        transport: Arc<dyn Transport>,
        tracker: SharedTracker,
    ) -> Self {
        Self {
            roster,
            transport,
            tracker,
        }
    }

    pub async fn dispatch(&self, event: InboundEvent) -> DispatchOutcome {
        match event {
            InboundEvent::Acknowledge {
                control_id,
                requester,
                owner,
            } => self.handle_acknowledgment(&control_id, requester, owner).await,
            InboundEvent::Register { requester, handle } => {
                self.handle_registration(requester, handle.as_deref()).await
            }
            InboundEvent::UnknownControl { control_id } => {
                tracing::debug!(control_id = %control_id, "Ignoring unrecognised button press");
                self.clear_control(&control_id).await;
                DispatchOutcome::IgnoredControl
            }
        }
    }

    /// Confirm, reply, then clear the button's pending state.
    async fn handle_acknowledgment(
        &self,
        control_id: &str,
        requester: UserId,
        owner: UserId,
    ) -> DispatchOutcome {
        let key = NotificationKey::new(requester, owner);
        let confirmed = self.tracker.lock().await.record_confirmation(key);

        let outcome = match confirmed {
            ConfirmOutcome::Confirmed => {
                tracing::info!(recipient = %requester, owner = %owner, "Transfer confirmed");
                self.reply(requester, MSG_CONFIRMED).await;
                DispatchOutcome::Confirmed
            }
            ConfirmOutcome::AlreadyConfirmed => {
                tracing::debug!(recipient = %requester, owner = %owner, "Duplicate confirmation");
                self.reply(requester, MSG_ALREADY_CONFIRMED).await;
                DispatchOutcome::AlreadyConfirmed
            }
            ConfirmOutcome::UnknownKey => {
                tracing::warn!(
                    recipient = %requester,
                    owner = %owner,
                    "Acknowledgment for a reminder that was never delivered"
                );
                DispatchOutcome::UnknownReminder
            }
        };

        self.clear_control(control_id).await;
        outcome
    }

    /// Bind `requester` to their roster row, found by identity or handle.
    async fn handle_registration(&self, requester: UserId, handle: Option<&str>) -> DispatchOutcome {
        let handle = handle.and_then(normalize_handle);
        tracing::info!(user_id = %requester, handle = ?handle, "Registration request");

        let lookup = match self.roster.find_by_identity(requester).await {
            Ok(None) => match handle.as_deref() {
                Some(h) => self.roster.find_by_handle(h).await,
                None => Ok(None),
            },
            other => other,
        };

        let entry = match lookup {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::warn!(user_id = %requester, handle = ?handle, "Requester not in roster");
                self.reply(requester, MSG_NOT_IN_ROSTER).await;
                return DispatchOutcome::NotInRoster;
            }
            Err(e) => {
                tracing::error!(user_id = %requester, error = %e, "Roster lookup failed");
                self.reply(requester, MSG_REGISTRATION_FAILED).await;
                return DispatchOutcome::RegistrationFailed;
            }
        };

        let id_changed = entry.user_id() != Some(requester);
        let handle_changed = handle
            .as_deref()
            .is_some_and(|h| entry.tg_username.as_deref() != Some(h));

        if !id_changed && !handle_changed {
            tracing::info!(user_id = %requester, entry_id = entry.id, "Registration already current");
            self.reply(requester, MSG_ALREADY_REGISTERED).await;
            return DispatchOutcome::AlreadyRegistered;
        }

        match self
            .roster
            .bind_identity(entry.id, requester, handle.as_deref())
            .await
        {
            Ok(()) => {
                tracing::info!(
                    user_id = %requester,
                    entry_id = entry.id,
                    id_changed,
                    handle_changed,
                    "Registration updated"
                );
                self.reply(requester, MSG_REGISTERED).await;
                DispatchOutcome::Registered
            }
            Err(e) => {
                tracing::error!(user_id = %requester, entry_id = entry.id, error = %e, "Binding identity failed");
                self.reply(requester, MSG_REGISTRATION_FAILED).await;
                DispatchOutcome::RegistrationFailed
            }
        }
    }

    async fn reply(&self, to: UserId, text: &str) {
        if let Err(e) = self.transport.send(to, text, None).await {
            tracing::warn!(user_id = %to, error = %e, "Reply not delivered");
        }
    }

    async fn clear_control(&self, control_id: &str) {
        if let Err(e) = self.transport.acknowledge_control(control_id).await {
            tracing::debug!(control_id = %control_id, error = %e, "Acknowledging button failed, ignoring");
        }
    }
}

/// Long-poll loop over the transport's update feed.
pub struct UpdatePoller {
    transport: Arc<dyn Transport>,
    dispatcher: UpdateDispatcher,
    poll_timeout_secs: u64,
    cursor: i64,
}

impl UpdatePoller {
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: UpdateDispatcher,
        poll_timeout_secs: u64,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            poll_timeout_secs,
            cursor: 0,
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Skip updates queued before startup without dispatching them.
    /// Returns how many were skipped.
    pub async fn drain_backlog(&mut self) -> usize {
        for attempt in 1..=BACKLOG_DRAIN_ATTEMPTS {
            match self
                .transport
                .poll_updates(self.cursor, BACKLOG_POLL_TIMEOUT_SECS)
                .await
            {
                Ok(batch) => {
                    let skipped = batch.events.len();
                    match batch.next_cursor {
                        Some(next) => {
                            self.advance(next);
                            tracing::info!(skipped, cursor = self.cursor, "Skipped queued updates");
                        }
                        None => tracing::info!("No queued updates to skip"),
                    }
                    return skipped;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = BACKLOG_DRAIN_ATTEMPTS,
                        error = %e,
                        "Could not fetch queued updates"
                    );
                }
            }

            if attempt < BACKLOG_DRAIN_ATTEMPTS {
                tokio::time::sleep(BACKLOG_DRAIN_DELAY).await;
            }
        }

        tracing::error!("Giving up on skipping queued updates");
        0
    }

    /// Advance the cursor and dispatch every event of a batch, in order.
    pub async fn apply(&mut self, batch: UpdateBatch) -> usize {
        if let Some(next) = batch.next_cursor {
            self.advance(next);
        }

        let count = batch.events.len();
        for event in batch.events {
            let outcome = self.dispatcher.dispatch(event).await;
            tracing::debug!(?outcome, "Update dispatched");
        }
        count
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A poll in flight when shutdown arrives gets a short grace period to
    /// finish, and whatever it returns is dispatched. Past that it is dropped;
    /// the cursor has not moved at that point, so nothing is lost.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_timeout_secs = self.poll_timeout_secs,
            "Update poller started"
        );

        loop {
            if shutdown_requested(&shutdown) {
                break;
            }

            let polled = {
                let mut poll = self
                    .transport
                    .poll_updates(self.cursor, self.poll_timeout_secs);
                tokio::select! {
                    polled = &mut poll => polled,
                    _ = shutdown.changed() => {
                        match tokio::time::timeout(SHUTDOWN_POLL_GRACE, &mut poll).await {
                            Ok(polled) => polled,
                            Err(_) => {
                                tracing::info!("Dropping idle long poll for shutdown");
                                break;
                            }
                        }
                    }
                }
            };

            match polled {
                Ok(batch) => {
                    let dispatched = self.apply(batch).await;
                    if dispatched > 0 {
                        tracing::debug!(dispatched, cursor = self.cursor, "Processed updates");
                    }
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        backoff_secs = POLL_ERROR_BACKOFF.as_secs(),
                        "Polling updates failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!(cursor = self.cursor, "Update poller stopped");
    }

    fn advance(&mut self, next: i64) {
        if next > self.cursor {
            self.cursor = next;
        }
    }
}
