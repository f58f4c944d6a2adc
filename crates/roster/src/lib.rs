//! Roster store implementations.
//!
//! - [`MemoryRosterStore`]: volatile, for tests and dry runs
//! - [`JsonRosterStore`]: a JSON file rewritten on every identity binding
//! - [`PgRosterStore`]: the `roster_entries` table in PostgreSQL

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::JsonRosterStore;
pub use memory::MemoryRosterStore;
pub use postgres::PgRosterStore;

use gift_common::types::{RosterEntry, UserId, normalize_handle};

/// Apply an identity binding to a row in place.
///
/// The handle is only overwritten when a non-empty one is supplied.
pub(crate) fn apply_binding(entry: &mut RosterEntry, id: UserId, handle: Option<&str>) {
    entry.tg_id = Some(id.get());
    if let Some(handle) = handle.and_then(normalize_handle) {
        entry.tg_username = Some(handle);
    }
}

/// Give rows without a key a positional one (1-based), leaving explicit keys alone.
pub(crate) fn assign_missing_ids(entries: &mut [RosterEntry]) {
    let mut next = entries.iter().map(|e| e.id).max().unwrap_or(0).max(0);
    for entry in entries.iter_mut().filter(|e| e.id == 0) {
        next += 1;
        entry.id = next;
    }
}
