//! Reconciliation of the local note replica with the remote store
//!
//! - Per-note status machine: Clean, LocallyModified, Conflicted, Synced
//! - Last-write-wins conflict resolution on `updatedAt`
//! - Bounded exponential backoff for transient transport failures
//! - One in-flight network call per note; different notes run concurrently

pub mod conflict;
pub mod engine;
pub mod retry;
pub mod state;

pub use conflict::{ConflictResolver, Resolution};
pub use engine::{SyncEngine, SyncReport};
pub use retry::RetryPolicy;
pub use state::{NoteStatus, SyncState};
