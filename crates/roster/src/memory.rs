use async_trait::async_trait;
use tokio::sync::RwLock;

use gift_common::error::AppError;
use gift_common::traits::RosterStore;
use gift_common::types::{RosterEntry, UserId};

use crate::{apply_binding, assign_missing_ids};

/// Volatile roster held entirely in memory.
pub struct MemoryRosterStore {
    entries: RwLock<Vec<RosterEntry>>,
}

impl MemoryRosterStore {
    pub fn new(mut entries: Vec<RosterEntry>) -> Self {
        assign_missing_ids(&mut entries);
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Replace a row wholesale (matched by `id`), e.g. to simulate an edit.
    pub async fn upsert(&self, entry: RosterEntry) {
        let mut entries = self.entries.write().await;
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }
}

#[async_trait]
impl RosterStore for MemoryRosterStore {
    async fn find_by_identity(&self, id: UserId) -> Result<Option<RosterEntry>, AppError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.user_id() == Some(id)).cloned())
    }

    async fn find_by_handle(&self, handle: &str) -> Result<Option<RosterEntry>, AppError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.matches_handle(handle)).cloned())
    }

    async fn all(&self) -> Result<Vec<RosterEntry>, AppError> {
        Ok(self.entries.read().await.clone())
    }

    async fn bind_identity(
        &self,
        entry_id: i64,
        id: UserId,
        handle: Option<&str>,
    ) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| AppError::Roster(format!("roster entry {entry_id} not found")))?;
        apply_binding(entry, id, handle);
        Ok(())
    }
}
