//! JSON file roster.
//!
//! The whole file is loaded at startup and kept in memory. Identity bindings
//! are written through to disk (temporary file + rename) before the in-memory
//! copy is updated, so a failed write leaves both sides unchanged.
//!
//! Rows that do not parse are skipped with a warning and written back
//! untouched on the next save.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use gift_common::error::AppError;
use gift_common::traits::RosterStore;
use gift_common::types::{RosterEntry, UserId};

use crate::{apply_binding, assign_missing_ids};

/// Roster backed by a JSON array of [`RosterEntry`] rows.
pub struct JsonRosterStore {
    path: PathBuf,
    entries: RwLock<Vec<RosterEntry>>,
    /// Unparseable rows, kept verbatim.
    rejected: Vec<Value>,
}

impl JsonRosterStore {
    /// Load the roster file. A missing file or one that is not a JSON array
    /// is a startup error; a malformed row only loses that row.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            AppError::Roster(format!("cannot read roster file {}: {e}", path.display()))
        })?;
        let rows: Vec<Value> = serde_json::from_str(&raw)?;
        let (mut entries, rejected) = split_rows(rows);
        assign_missing_ids(&mut entries);

        let registered = entries.iter().filter(|e| e.user_id().is_some()).count();
        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            registered,
            rejected = rejected.len(),
            "Roster file loaded"
        );

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            rejected,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows skipped at load time.
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    async fn persist(&self, entries: &[RosterEntry]) -> Result<(), AppError> {
        let mut rows = entries
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        rows.extend(self.rejected.iter().cloned());

        let json = serde_json::to_string_pretty(&rows)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), "Roster file saved");
        Ok(())
    }
}

/// Convert rows one by one, setting aside the ones that fail.
fn split_rows(rows: Vec<Value>) -> (Vec<RosterEntry>, Vec<Value>) {
    let mut entries = Vec::with_capacity(rows.len());
    let mut rejected = Vec::new();

    for (index, row) in rows.into_iter().enumerate() {
        match serde_json::from_value::<RosterEntry>(row.clone()) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(row = index + 1, error = %e, "Skipping malformed roster row");
                rejected.push(row);
            }
        }
    }

    (entries, rejected)
}

#[async_trait]
impl RosterStore for JsonRosterStore {
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
        // Held across the write so concurrent bindings serialise on the file.
        let mut entries = self.entries.write().await;

        let mut updated = entries.clone();
        let entry = updated
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| AppError::Roster(format!("roster entry {entry_id} not found")))?;
        apply_binding(entry, id, handle);

        self.persist(&updated).await?;
        *entries = updated;

        tracing::info!(entry_id, user_id = %id, "Identity bound in roster file");
        Ok(())
    }
}
