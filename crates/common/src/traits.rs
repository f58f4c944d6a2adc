//! Collaborator seams: the roster and the messaging transport.
//!
//! The scheduling core only ever talks to these traits, so tests can inject
//! in-memory fakes and deployments can pick a concrete backend at startup.

use async_trait::async_trait;

use crate::error::AppError;
use crate::types::{AckControl, RosterEntry, UpdateBatch, UserId};

/// Source of roster rows and sink for identity bindings.
#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn find_by_identity(&self, id: UserId) -> Result<Option<RosterEntry>, AppError>;

    /// `handle` may be given with or without the leading `@`.
    async fn find_by_handle(&self, handle: &str) -> Result<Option<RosterEntry>, AppError>;

    /// Snapshot of every row. May be stale by the time it is used.
    async fn all(&self) -> Result<Vec<RosterEntry>, AppError>;

    /// Bind a chat identity (and handle, when known) to row `entry_id`,
    /// persisting the change durably before returning.
    async fn bind_identity(
        &self,
        entry_id: i64,
        id: UserId,
        handle: Option<&str>,
    ) -> Result<(), AppError>;
}

/// Remote messaging endpoint.
///
/// Implementations bound every call with a timeout and report failures as
/// [`AppError::Transport`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        target: UserId,
        text: &str,
        control: Option<&AckControl>,
    ) -> Result<(), AppError>;

    /// Clear the pending state of a pressed button. Best-effort.
    async fn acknowledge_control(&self, control_id: &str) -> Result<(), AppError>;

    /// Long-poll for inbound events newer than `cursor`.
    async fn poll_updates(&self, cursor: i64, timeout_secs: u64) -> Result<UpdateBatch, AppError>;

    /// Drop any push subscription that would conflict with polling. Idempotent.
    async fn remove_stale_subscription(&self) -> Result<(), AppError>;
}
