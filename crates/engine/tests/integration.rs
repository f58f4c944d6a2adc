//! End-to-end tests for the reminder engine: scheduler ticks, delivery
//! retries, acknowledgments and registrations against an in-memory roster and
//! a recording transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use tokio::sync::watch;

use gift_common::error::AppError;
use gift_common::traits::{RosterStore, Transport};
use gift_common::types::{
    AckControl, FundsRecipient, InboundEvent, NotificationKey, RosterEntry, UpdateBatch, UserId,
};
use gift_engine::{
    DeliveryPolicy, DispatchOutcome, ManualClock, NotificationState, NotificationTracker,
    Scheduler, SchedulerSettings, SharedTracker, UpdateDispatcher, UpdatePoller,
};
use gift_roster::MemoryRosterStore;

// ============================================================
// Shared helpers
// ============================================================

#[derive(Debug, Clone)]
struct SentMessage {
    target: UserId,
    text: String,
    control: Option<AckControl>,
}

/// Transport that records everything and can be told to fail sends.
#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<SentMessage>>,
    acknowledged: Mutex<Vec<String>>,
    polls: Mutex<Vec<(i64, u64)>>,
    /// Scripted poll results, each returned after its delay.
    queued: Mutex<VecDeque<(StdDuration, Result<UpdateBatch, AppError>)>>,
    fail_sends: AtomicBool,
}

impl FakeTransport {
    fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_to(&self, id: i64) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.target.get() == id)
            .collect()
    }

    fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.lock().unwrap().clone()
    }

    fn polls(&self) -> Vec<(i64, u64)> {
        self.polls.lock().unwrap().clone()
    }

    fn queue(&self, batch: Result<UpdateBatch, AppError>) {
        self.queue_after(StdDuration::ZERO, batch);
    }

    fn queue_after(&self, delay: StdDuration, batch: Result<UpdateBatch, AppError>) {
        self.queued.lock().unwrap().push_back((delay, batch));
    }

    fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(
        &self,
        target: UserId,
        text: &str,
        control: Option<&AckControl>,
    ) -> Result<(), AppError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(AppError::Transport("simulated outage".to_string()));
        }
        self.sent.lock().unwrap().push(SentMessage {
            target,
            text: text.to_string(),
            control: control.cloned(),
        });
        Ok(())
    }

    async fn acknowledge_control(&self, control_id: &str) -> Result<(), AppError> {
        self.acknowledged.lock().unwrap().push(control_id.to_string());
        Ok(())
    }

    async fn poll_updates(&self, cursor: i64, timeout_secs: u64) -> Result<UpdateBatch, AppError> {
        self.polls.lock().unwrap().push((cursor, timeout_secs));
        let next = self.queued.lock().unwrap().pop_front();
        match next {
            Some((delay, batch)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                batch
            }
            None => {
                // Behave like an idle long poll.
                tokio::time::sleep(StdDuration::from_secs(timeout_secs)).await;
                Ok(UpdateBatch::default())
            }
        }
    }

    async fn remove_stale_subscription(&self) -> Result<(), AppError> {
        Ok(())
    }
}

fn moscow(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(3 * 3600)
        .unwrap()
        .with_ymd_and_hms(2026, 6, day, hour, minute, 0)
        .unwrap()
}

fn person(id: i64, tg_id: i64, name: &str, day: u32, month: u32, amount: Option<i64>) -> RosterEntry {
    RosterEntry {
        id,
        tg_id: Some(tg_id),
        tg_username: Some(format!("@{}", name.to_lowercase())),
        name: name.to_string(),
        birthday: Some(format!("{day}.{month}")),
        notify_day: day,
        notify_month: month,
        notify_time: Some("09:00".to_string()),
        amount,
        funds: FundsRecipient {
            handle: "@collector".to_string(),
            phone: "+70000000000".to_string(),
            bank: "Tinkoff".to_string(),
        },
    }
}

/// Eve (tg 100) has a birthday on 15 June at 09:00; Rick (tg 200) owes 500.
fn default_roster() -> Vec<RosterEntry> {
    vec![
        person(1, 100, "Eve", 15, 6, Some(1000)),
        person(2, 200, "Rick", 1, 1, Some(500)),
    ]
}

struct Harness {
    roster: Arc<MemoryRosterStore>,
    transport: Arc<FakeTransport>,
    tracker: SharedTracker,
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
    dispatcher: UpdateDispatcher,
}

fn harness(entries: Vec<RosterEntry>, start: DateTime<FixedOffset>) -> Harness {
    let roster = Arc::new(MemoryRosterStore::new(entries));
    let transport = Arc::new(FakeTransport::default());
    let tracker = NotificationTracker::shared(DeliveryPolicy::default());
    let clock = Arc::new(ManualClock::new(start));

    let scheduler = Scheduler::new(
        roster.clone(),
        transport.clone(),
        tracker.clone(),
        clock.clone(),
        SchedulerSettings::default(),
    );
    let dispatcher = UpdateDispatcher::new(roster.clone(), transport.clone(), tracker.clone());

    Harness {
        roster,
        transport,
        tracker,
        clock,
        scheduler,
        dispatcher,
    }
}

fn key(recipient: i64, owner: i64) -> NotificationKey {
    NotificationKey::new(UserId::new(recipient).unwrap(), UserId::new(owner).unwrap())
}

fn ack(control_id: &str, requester: i64, owner: i64) -> InboundEvent {
    InboundEvent::Acknowledge {
        control_id: control_id.to_string(),
        requester: UserId::new(requester).unwrap(),
        owner: UserId::new(owner).unwrap(),
    }
}

// ============================================================
// Scheduling
// ============================================================

#[tokio::test]
async fn test_trigger_time_is_a_lower_bound() {
    let h = harness(default_roster(), moscow(15, 8, 59));

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.due_events, 0);
    assert!(h.transport.sent().is_empty());

    h.clock.set(moscow(15, 9, 0));
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.due_events, 1);
    assert_eq!(report.sent, 1);

    let sent = h.transport.sent_to(200);
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].control.as_ref().map(|c| c.payload.as_str()),
        Some("ack:100")
    );
    assert!(h.transport.sent_to(100).is_empty(), "owner must not be reminded");
}

#[tokio::test]
async fn test_retry_respects_min_interval() {
    let h = harness(default_roster(), moscow(15, 9, 0));
    let t0 = moscow(15, 9, 0);

    h.scheduler.tick().await.unwrap();
    {
        let tracker = h.tracker.lock().await;
        let record = tracker.record(&key(200, 100)).unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_attempt_at, Some(t0));
    }

    h.clock.set(t0 + Duration::hours(1));
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.skipped, 1);

    h.clock.set(t0 + Duration::minutes(121));
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.sent, 1);

    assert_eq!(h.transport.sent_to(200).len(), 2);
    assert_eq!(h.tracker.lock().await.record(&key(200, 100)).unwrap().attempts, 2);
}

#[tokio::test]
async fn test_attempts_capped_at_three() {
    let h = harness(default_roster(), moscow(15, 9, 0));

    for hour in [9, 11, 13, 15, 17, 19, 21, 23] {
        h.clock.set(moscow(15, hour, 0));
        h.scheduler.tick().await.unwrap();
    }

    assert_eq!(h.transport.sent_to(200).len(), 3);
    let tracker = h.tracker.lock().await;
    assert_eq!(tracker.state(&key(200, 100)), NotificationState::Exhausted);
    assert_eq!(tracker.record(&key(200, 100)).unwrap().attempts, 3);
}

#[tokio::test]
async fn test_every_minute_for_a_day_never_double_sends() {
    let h = harness(default_roster(), moscow(15, 0, 0));
    let mut last_sent_at: Option<DateTime<FixedOffset>> = None;

    for minute in 0..(24 * 60) {
        let now = moscow(15, 0, 0) + Duration::minutes(minute);
        h.clock.set(now);
        let report = h.scheduler.tick().await.unwrap();
        if report.sent > 0 {
            if let Some(previous) = last_sent_at {
                assert!(now - previous >= Duration::hours(2));
            }
            last_sent_at = Some(now);
        }
    }

    assert_eq!(h.transport.sent_to(200).len(), 3);
}

#[tokio::test]
async fn test_unregistered_owner_generates_no_sends() {
    let mut roster = default_roster();
    roster[0].tg_id = None;
    let h = harness(roster, moscow(15, 12, 0));

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.due_events, 0);
    assert_eq!(report.sent + report.skipped + report.failed, 0);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_unregistered_recipient_is_skipped() {
    let mut roster = default_roster();
    roster.push(person(3, 0, "Ghost", 2, 2, Some(100)));
    let h = harness(roster, moscow(15, 9, 30));

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn test_amount_comes_from_each_recipient() {
    let mut roster = default_roster();
    roster.push(person(3, 300, "Mia", 2, 2, Some(700)));
    let h = harness(roster, moscow(15, 9, 0));

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.sent, 2);

    let rick = &h.transport.sent_to(200)[0].text;
    let mia = &h.transport.sent_to(300)[0].text;
    assert!(rick.contains("500 rubles"));
    assert!(mia.contains("700 rubles"));
    assert!(!rick.contains("1000"));
    assert!(rick.contains("Eve (@eve)"));
    assert!(rick.contains("Tinkoff"));
}

#[tokio::test]
async fn test_failed_send_does_not_consume_attempt() {
    let h = harness(default_roster(), moscow(15, 9, 0));

    h.transport.set_failing(true);
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.tracker.lock().await.state(&key(200, 100)), NotificationState::Unseen);

    // Next tick retries right away: the interval only counts successful sends.
    h.transport.set_failing(false);
    h.clock.advance(Duration::minutes(1));
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(h.tracker.lock().await.record(&key(200, 100)).unwrap().attempts, 1);
}

#[tokio::test]
async fn test_many_recipients_in_one_tick() {
    let mut roster = vec![person(1, 100, "Eve", 15, 6, None)];
    for i in 0..50 {
        roster.push(person(10 + i, 1000 + i, &format!("Friend{i}"), 1, 1, Some(100)));
    }
    let h = harness(roster, moscow(15, 10, 0));

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.sent, 50);

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.skipped, 50);
    assert_eq!(h.transport.sent().len(), 50);
}

#[tokio::test]
async fn test_tracker_records_purged_after_retention() {
    let h = harness(default_roster(), moscow(15, 9, 0));
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.tracker.lock().await.tracked_count(), 1);

    h.clock.set(moscow(16, 9, 0));
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.purged, 0);

    h.clock.set(moscow(17, 9, 0));
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.purged, 1);
    assert_eq!(h.tracker.lock().await.tracked_count(), 0);
}

// ============================================================
// Acknowledgments
// ============================================================

#[tokio::test]
async fn test_acknowledgment_stops_retries() {
    let h = harness(default_roster(), moscow(15, 9, 0));
    h.scheduler.tick().await.unwrap();

    let outcome = h.dispatcher.dispatch(ack("cb-1", 200, 100)).await;
    assert_eq!(outcome, DispatchOutcome::Confirmed);
    assert_eq!(h.tracker.lock().await.state(&key(200, 100)), NotificationState::Confirmed);
    assert_eq!(h.transport.acknowledged(), vec!["cb-1".to_string()]);

    let replies = h.transport.sent_to(200);
    assert_eq!(replies.len(), 2);
    assert!(replies[1].text.contains("noted"));
    assert!(replies[1].control.is_none());

    h.clock.set(moscow(15, 12, 0));
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(h.tracker.lock().await.record(&key(200, 100)).unwrap().attempts, 1);
}

#[tokio::test]
async fn test_duplicate_acknowledgment_leaves_state_unchanged() {
    let h = harness(default_roster(), moscow(15, 9, 0));
    h.scheduler.tick().await.unwrap();

    h.dispatcher.dispatch(ack("cb-1", 200, 100)).await;
    let after_first = h.tracker.lock().await.record(&key(200, 100)).cloned();

    let outcome = h.dispatcher.dispatch(ack("cb-2", 200, 100)).await;
    assert_eq!(outcome, DispatchOutcome::AlreadyConfirmed);
    assert_eq!(h.tracker.lock().await.record(&key(200, 100)).cloned(), after_first);

    // The second press is answered again.
    assert_eq!(h.transport.sent_to(200).len(), 3);
    assert_eq!(h.transport.acknowledged().len(), 2);
}

#[tokio::test]
async fn test_acknowledgment_for_unknown_reminder() {
    let h = harness(default_roster(), moscow(15, 8, 0));

    let outcome = h.dispatcher.dispatch(ack("cb-9", 200, 100)).await;
    assert_eq!(outcome, DispatchOutcome::UnknownReminder);
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.transport.acknowledged(), vec!["cb-9".to_string()]);
    assert_eq!(h.tracker.lock().await.tracked_count(), 0);
}

#[tokio::test]
async fn test_unknown_control_is_only_cleared() {
    let h = harness(default_roster(), moscow(15, 8, 0));
    let outcome = h
        .dispatcher
        .dispatch(InboundEvent::UnknownControl {
            control_id: "cb-x".to_string(),
        })
        .await;
    assert_eq!(outcome, DispatchOutcome::IgnoredControl);
    assert_eq!(h.transport.acknowledged(), vec!["cb-x".to_string()]);
    assert!(h.transport.sent().is_empty());
}

// ============================================================
// Registration
// ============================================================

fn register(requester: i64, handle: Option<&str>) -> InboundEvent {
    InboundEvent::Register {
        requester: UserId::new(requester).unwrap(),
        handle: handle.map(str::to_string),
    }
}

#[tokio::test]
async fn test_registration_binds_by_handle() {
    let mut roster = default_roster();
    roster[1].tg_id = Some(0);
    let h = harness(roster, moscow(15, 8, 0));

    let outcome = h.dispatcher.dispatch(register(555, Some("rick"))).await;
    assert_eq!(outcome, DispatchOutcome::Registered);

    let bound = h
        .roster
        .find_by_identity(UserId::new(555).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bound.id, 2);
    assert_eq!(h.transport.sent_to(555).len(), 1);

    // Once bound, the new identity receives reminders.
    h.clock.set(moscow(15, 9, 0));
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.transport.sent_to(555).len(), 2);
}

#[tokio::test]
async fn test_registration_already_current() {
    let h = harness(default_roster(), moscow(15, 8, 0));
    let outcome = h.dispatcher.dispatch(register(200, Some("rick"))).await;
    assert_eq!(outcome, DispatchOutcome::AlreadyRegistered);
    assert!(h.transport.sent_to(200)[0].text.contains("up to date"));
}

#[tokio::test]
async fn test_registration_updates_changed_handle() {
    let h = harness(default_roster(), moscow(15, 8, 0));
    let outcome = h.dispatcher.dispatch(register(200, Some("rick_new"))).await;
    assert_eq!(outcome, DispatchOutcome::Registered);

    let entry = h
        .roster
        .find_by_identity(UserId::new(200).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.tg_username.as_deref(), Some("@rick_new"));
}

#[tokio::test]
async fn test_registration_not_in_roster() {
    let h = harness(default_roster(), moscow(15, 8, 0));
    let outcome = h.dispatcher.dispatch(register(999, Some("stranger"))).await;
    assert_eq!(outcome, DispatchOutcome::NotInRoster);
    assert!(h.transport.sent_to(999)[0].text.contains("not found"));

    let outcome = h.dispatcher.dispatch(register(998, None)).await;
    assert_eq!(outcome, DispatchOutcome::NotInRoster);
}

// ============================================================
// Update poller and shutdown
// ============================================================

#[tokio::test]
async fn test_poller_applies_batches_and_advances_cursor() {
    let h = harness(default_roster(), moscow(15, 8, 0));
    let mut poller = UpdatePoller::new(h.transport.clone(), h.dispatcher.clone(), 60);

    let dispatched = poller
        .apply(UpdateBatch {
            events: vec![register(200, Some("rick"))],
            next_cursor: Some(42),
        })
        .await;
    assert_eq!(dispatched, 1);
    assert_eq!(poller.cursor(), 42);

    // A stale cursor never moves us backwards.
    poller
        .apply(UpdateBatch {
            events: vec![],
            next_cursor: Some(10),
        })
        .await;
    assert_eq!(poller.cursor(), 42);
}

#[tokio::test]
async fn test_drain_backlog_skips_without_dispatching() {
    let h = harness(default_roster(), moscow(15, 8, 0));
    h.transport.queue(Ok(UpdateBatch {
        events: vec![register(200, Some("rick")), register(999, None)],
        next_cursor: Some(7),
    }));

    let mut poller = UpdatePoller::new(h.transport.clone(), h.dispatcher.clone(), 60);
    let skipped = poller.drain_backlog().await;

    assert_eq!(skipped, 2);
    assert_eq!(poller.cursor(), 7);
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.transport.polls(), vec![(0, 1)]);
}

#[tokio::test(start_paused = true)]
async fn test_drain_backlog_retries_on_error() {
    let h = harness(default_roster(), moscow(15, 8, 0));
    h.transport
        .queue(Err(AppError::Transport("connection reset".to_string())));
    h.transport.queue(Ok(UpdateBatch::default()));

    let mut poller = UpdatePoller::new(h.transport.clone(), h.dispatcher.clone(), 60);
    assert_eq!(poller.drain_backlog().await, 0);
    assert_eq!(h.transport.polls().len(), 2);
    assert_eq!(poller.cursor(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_loops_stop_on_shutdown() {
    let h = harness(default_roster(), moscow(15, 9, 0));
    h.transport.queue(Ok(UpdateBatch {
        events: vec![register(200, Some("rick"))],
        next_cursor: Some(5),
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = UpdatePoller::new(h.transport.clone(), h.dispatcher.clone(), 60);
    let poller_rx = shutdown_rx.clone();
    let poller_task = tokio::spawn(async move { poller.run(poller_rx).await });

    let scheduler = h.scheduler;
    let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tokio::time::sleep(StdDuration::from_secs(1)).await;
    shutdown_tx.send(true).unwrap();

    scheduler_task.await.unwrap();
    poller_task.await.unwrap();

    // One reminder from the first tick, one registration reply.
    let sent = h.transport.sent_to(200);
    assert_eq!(sent.len(), 2);
    assert_eq!(h.transport.polls()[1].0, 5);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_lets_in_flight_poll_finish() {
    let h = harness(default_roster(), moscow(15, 8, 0));
    h.transport.queue_after(
        StdDuration::from_secs(1),
        Ok(UpdateBatch {
            events: vec![register(200, Some("rick"))],
            next_cursor: Some(9),
        }),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = UpdatePoller::new(h.transport.clone(), h.dispatcher.clone(), 60);
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    tokio::time::sleep(StdDuration::from_millis(500)).await;
    shutdown_tx.send(true).unwrap();
    poller_task.await.unwrap();

    // The batch landed during the grace period and was dispatched.
    assert_eq!(h.transport.sent_to(200).len(), 1);
    assert_eq!(h.transport.polls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_error_backs_off_before_retrying() {
    let h = harness(default_roster(), moscow(15, 8, 0));
    h.transport
        .queue(Err(AppError::Transport("bad gateway".to_string())));
    h.transport.queue(Ok(UpdateBatch {
        events: vec![register(200, Some("rick"))],
        next_cursor: Some(3),
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = UpdatePoller::new(h.transport.clone(), h.dispatcher.clone(), 60);
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    tokio::time::sleep(StdDuration::from_secs(5)).await;
    assert_eq!(h.transport.polls().len(), 1);
    assert!(h.transport.sent().is_empty());

    tokio::time::sleep(StdDuration::from_secs(6)).await;
    let polls = h.transport.polls();
    assert_eq!(polls.len(), 3);
    assert_eq!(polls[1].0, 0, "cursor must not move on error");
    assert_eq!(polls[2].0, 3);
    assert_eq!(h.transport.sent_to(200).len(), 1);

    shutdown_tx.send(true).unwrap();
    poller_task.await.unwrap();
}
