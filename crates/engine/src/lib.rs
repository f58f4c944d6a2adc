//! Reminder scheduling core.
//!
//! - [`tracker`]: per (recipient, event owner) delivery state machine
//! - [`scheduler`]: periodic scan of the roster for birthdays that are due
//! - [`delivery`]: one reminder send, gated by the tracker
//! - [`dispatcher`]: inbound acknowledgments and registrations
//! - [`clock`]: injectable time source

pub mod clock;
pub mod delivery;
pub mod dispatcher;
pub mod scheduler;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{DeliveryOutcome, ReminderDelivery};
pub use dispatcher::{DispatchOutcome, UpdateDispatcher, UpdatePoller};
pub use scheduler::{Scheduler, SchedulerSettings, TickReport};
pub use tracker::{
    ConfirmOutcome, DeliveryPolicy, NotificationRecord, NotificationState, NotificationTracker,
    SharedTracker,
};
