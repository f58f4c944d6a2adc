use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// External chat identity of a person (Telegram user id).
///
/// Zero is what unregistered roster rows carry, so it is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// Wrap a raw id, rejecting the unset value `0`.
    pub fn new(raw: i64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the collected gift money goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsRecipient {
    /// Chat handle of the person collecting the money.
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub bank: String,
}

/// One row of the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Row key owned by the roster store.
    #[serde(default)]
    pub id: i64,
    /// Bound chat identity; `None` or `0` while the person has not registered.
    #[serde(default)]
    pub tg_id: Option<i64>,
    /// Chat handle, stored with a leading `@`.
    #[serde(default)]
    pub tg_username: Option<String>,
    pub name: String,
    /// Birthday as shown in reminders (e.g. "15.6").
    #[serde(default)]
    pub birthday: Option<String>,
    /// `0` (blank) means the entry is never due.
    #[serde(default)]
    pub notify_day: u32,
    #[serde(default)]
    pub notify_month: u32,
    /// Time of day the reminder becomes due, `HH:MM` or `HH:MM:SS`.
    #[serde(default)]
    pub notify_time: Option<String>,
    /// Amount this person owes when someone else's birthday comes up.
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub funds: FundsRecipient,
}

impl RosterEntry {
    /// The bound identity, if the person has registered.
    pub fn user_id(&self) -> Option<UserId> {
        self.tg_id.and_then(UserId::new)
    }

    /// Parse the configured trigger time.
    pub fn trigger_time(&self) -> Result<TriggerTime, AppError> {
        match self.notify_time.as_deref() {
            Some(raw) => TriggerTime::parse(raw),
            None => Err(AppError::Data(format!(
                "entry {} ({}) has no notification time",
                self.id, self.name
            ))),
        }
    }

    /// Case-insensitive handle comparison; `handle` may omit the `@`.
    pub fn matches_handle(&self, handle: &str) -> bool {
        match (self.tg_username.as_deref(), normalize_handle(handle)) {
            (Some(stored), Some(wanted)) => stored.eq_ignore_ascii_case(&wanted),
            _ => false,
        }
    }

    /// Human-readable date of the occasion.
    pub fn date_label(&self) -> String {
        match self.birthday.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => format!("{}.{}", self.notify_day, self.notify_month),
        }
    }
}

/// Time of day at which a reminder becomes due (minute precision).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TriggerTime {
    pub hour: u32,
    pub minute: u32,
}

impl TriggerTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// Accepts `HH:MM:SS` and `HH:MM`.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let raw = raw.trim();
        ["%H:%M:%S", "%H:%M"]
            .iter()
            .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
            .map(|t| Self {
                hour: t.hour(),
                minute: t.minute(),
            })
            .ok_or_else(|| AppError::Data(format!("unrecognised notification time {raw:?}")))
    }

    /// True once the wall clock has reached this trigger (seconds are ignored).
    pub fn is_reached_at(&self, time: NaiveTime) -> bool {
        (self.hour, self.minute) <= (time.hour(), time.minute())
    }
}

impl std::fmt::Display for TriggerTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// A birthday occurrence due today, rebuilt from the roster on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub owner: UserId,
    pub owner_handle: Option<String>,
    pub display_name: String,
    pub date_label: String,
    pub trigger: TriggerTime,
    pub funds: FundsRecipient,
}

impl Event {
    pub fn new(owner: UserId, trigger: TriggerTime, entry: &RosterEntry) -> Self {
        Self {
            owner,
            owner_handle: entry.tg_username.clone(),
            display_name: entry.name.clone(),
            date_label: entry.date_label(),
            trigger,
            funds: entry.funds.clone(),
        }
    }
}

/// Identifies one tracked reminder: who is being reminded about whose birthday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationKey {
    pub recipient: UserId,
    pub owner: UserId,
}

impl NotificationKey {
    pub fn new(recipient: UserId, owner: UserId) -> Self {
        Self { recipient, owner }
    }
}

impl std::fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.recipient, self.owner)
    }
}

const ACK_PREFIX: &str = "ack:";

/// Inline button attached to a reminder so the recipient can confirm the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckControl {
    pub label: String,
    /// Opaque payload echoed back by the transport on press.
    pub payload: String,
}

impl AckControl {
    pub fn for_owner(owner: UserId) -> Self {
        Self {
            label: "Transferred".to_string(),
            payload: format!("{ACK_PREFIX}{owner}"),
        }
    }

    /// Recover the event owner from a pressed button's payload.
    pub fn parse_owner(payload: &str) -> Option<UserId> {
        payload
            .strip_prefix(ACK_PREFIX)
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(UserId::new)
    }
}

/// Inbound event produced by the transport's update feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A reminder's acknowledgment button was pressed.
    Acknowledge {
        control_id: String,
        requester: UserId,
        owner: UserId,
    },
    /// A registration request (`/start`).
    Register {
        requester: UserId,
        handle: Option<String>,
    },
    /// A button press whose payload we do not understand.
    UnknownControl { control_id: String },
}

/// Result of one long-poll request.
#[derive(Debug, Clone, Default)]
pub struct UpdateBatch {
    pub events: Vec<InboundEvent>,
    /// Cursor to pass to the next poll; `None` when nothing new was seen.
    pub next_cursor: Option<i64>,
}

/// Normalise a chat handle to the stored `@name` form.
pub fn normalize_handle(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('@');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("@{trimmed}"))
    }
}
