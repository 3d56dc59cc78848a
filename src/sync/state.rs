//! Per-note sync bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a note stands relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    /// Unmodified since it was loaded; not yet confirmed by the remote in this session.
    Clean,
    /// Edited locally; the edit has not been pushed.
    LocallyModified,
    /// The remote moved ahead while a local edit was pending, and the local
    /// content won last-write-wins. Needs a push to settle.
    Conflicted,
    /// Matches the remote as of `last_synced_at`.
    Synced,
}

impl NoteStatus {
    /// True when the local copy carries content the remote has not seen.
    pub fn has_pending_changes(&self) -> bool {
        matches!(self, Self::LocallyModified | Self::Conflicted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub status: NoteStatus,
    pub local_version: u64,
    pub remote_version: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// A note that has only ever existed on this device.
    pub fn local(version: u64) -> Self {
        Self {
            status: NoteStatus::LocallyModified,
            local_version: version,
            remote_version: 0,
            last_synced_at: None,
        }
    }

    /// A note loaded with no pending changes, last known at `version` remotely.
    pub fn clean(version: u64) -> Self {
        Self {
            status: NoteStatus::Clean,
            local_version: version,
            remote_version: version,
            last_synced_at: None,
        }
    }

    pub(crate) fn mark_edited(&mut self, version: u64) {
        self.status = NoteStatus::LocallyModified;
        self.local_version = version;
    }

    pub(crate) fn mark_synced(&mut self, version: u64, at: DateTime<Utc>) {
        self.status = NoteStatus::Synced;
        self.local_version = version;
        self.remote_version = version;
        self.last_synced_at = Some(at);
    }

    pub(crate) fn mark_conflicted(&mut self, local_version: u64, remote_version: u64) {
        self.status = NoteStatus::Conflicted;
        self.local_version = local_version;
        self.remote_version = remote_version;
    }
}
