//! Sync engine: orchestrates push/pull/resolve/apply for the local replica.
//!
//! Every note lives in its own slot behind an async mutex. Any operation
//! touching a note, including its network round trips, holds that note's
//! lock for the whole exchange, so two requests for the same id are never
//! in flight together while different notes proceed in parallel. The slot
//! table itself sits behind a short-lived synchronous lock that is never
//! held across an await point.

use crate::codec;
use crate::config::Config;
use crate::error::{ErrorCategory, ErrorKind, Result, SealnoteError};
use crate::keystore::MasterKey;
use crate::note::{Note, NoteId, next_version};
use crate::store::StoredNote;
use crate::sync::conflict::{ConflictResolver, Resolution};
use crate::sync::state::{NoteStatus, SyncState};
use crate::transport::{Method, Session, TransportClient};
use chrono::Utc;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as NoteLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Entry {
    note: Note,
    state: SyncState,
}

type Slot = Arc<NoteLock<Option<Entry>>>;

/// Interpreted reply of the remote store.
enum Reply {
    Body(Vec<u8>),
    NotFound,
    Conflict(Vec<u8>),
}

/// What reconciling one remote record did to the local replica.
enum Applied {
    Unchanged,
    Adopted { note: Note, conflict: bool },
    KeptLocal,
}

#[derive(Default)]
struct Pulled {
    adopted: Vec<Note>,
    conflicts: usize,
    skipped: usize,
}

struct PushOutcome {
    version: u64,
    sent: bool,
    conflicts: usize,
}

/// Counts from one full [`SyncEngine::sync`] cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Notes whose local edits reached the remote store (or lost to a newer remote copy).
    pub pushed: usize,
    /// Notes replaced by remote content.
    pub pulled: usize,
    /// Conflicts settled by last-write-wins along the way.
    pub conflicts_resolved: usize,
    /// Remote records left alone because they were malformed or did not
    /// open under the master key.
    pub skipped: usize,
}

/// Keeps a local replica of the user's notes in step with the remote store.
pub struct SyncEngine {
    transport: Arc<dyn TransportClient>,
    key: MasterKey,
    config: Config,
    slots: Mutex<HashMap<NoteId, Slot>>,
}

impl SyncEngine {
    pub fn new(transport: Arc<dyn TransportClient>, key: MasterKey, config: Config) -> Self {
        Self {
            transport,
            key,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    // --- Local changes ---

    /// Add a note written on this device. It starts out `LocallyModified`.
    pub async fn insert(&self, note: Note) -> Result<()> {
        let slot = self.slot(note.id());
        let mut guard = slot.lock().await;
        if guard.is_some() {
            return Err(SealnoteError::new(
                ErrorCategory::User,
                format!("note {} already exists", note.id()),
            ));
        }
        debug!(id = %note.id(), "new local note");
        let state = SyncState::local(note.version());
        *guard = Some(Entry { note, state });
        Ok(())
    }

    /// Create a note with a fresh id.
    pub async fn create(&self, plaintext: impl Into<Vec<u8>>) -> Result<NoteId> {
        let id = NoteId::generate();
        self.insert(Note::new(id.clone(), plaintext)).await?;
        Ok(id)
    }

    /// Replace a note's content, returning its new local version.
    pub async fn edit(&self, id: &NoteId, plaintext: impl Into<Vec<u8>>) -> Result<u64> {
        let slot = self.existing_slot(id)?;
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| not_found(id))?;
        entry.note.edit(plaintext)?;
        let version = entry.note.version();
        entry.state.mark_edited(version);
        debug!(%id, version, "local edit");
        Ok(version)
    }

    // --- Inspection ---

    /// The note with its plaintext, decrypting it on first access.
    pub async fn note(&self, id: &NoteId) -> Result<Note> {
        let slot = self.existing_slot(id)?;
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| not_found(id))?;
        entry.note.open(&self.key)?;
        Ok(entry.note.clone())
    }

    pub async fn state(&self, id: &NoteId) -> Option<SyncState> {
        let slot = self.slots.lock().get(id).cloned()?;
        let guard = slot.lock().await;
        guard.as_ref().map(|entry| entry.state.clone())
    }

    /// Ids of all notes in the replica, sorted.
    pub async fn ids(&self) -> Vec<NoteId> {
        let mut ids = Vec::new();
        for (id, slot) in self.all_slots() {
            if slot.lock().await.is_some() {
                ids.push(id);
            }
        }
        ids
    }

    /// Ids of notes carrying changes the remote has not seen.
    pub async fn pending_ids(&self) -> Vec<NoteId> {
        let mut ids = Vec::new();
        for (id, slot) in self.all_slots() {
            let guard = slot.lock().await;
            if guard
                .as_ref()
                .is_some_and(|entry| entry.state.status.has_pending_changes())
            {
                ids.push(id);
            }
        }
        ids
    }

    /// Check the master key against one sealed note of the replica.
    ///
    /// Returns `Ok(false)` when there is no sealed note to check against,
    /// and a `Decrypt` error when the key does not open it (typically a
    /// mistyped passphrase).
    pub async fn verify_key(&self) -> Result<bool> {
        for (_, slot) in self.all_slots() {
            let guard = slot.lock().await;
            if let Some(envelope) = guard.as_ref().and_then(|entry| entry.note.envelope()) {
                crate::cipher::decrypt(envelope, &self.key)
                    .map_err(|e| e.with_context("master key does not open existing notes"))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    // --- Persistence ---

    /// Sealed copies of every note plus their sync bookkeeping.
    pub async fn snapshot(&self) -> Result<Vec<StoredNote>> {
        let mut stored = Vec::new();
        for (_, slot) in self.all_slots() {
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.as_mut() {
                entry.note.seal(&self.key)?;
                stored.push(StoredNote {
                    record: codec::to_envelope(&entry.note)?,
                    state: entry.state.clone(),
                });
            }
        }
        Ok(stored)
    }

    /// Load notes saved by [`SyncEngine::snapshot`]. All records are
    /// validated before any is applied. Notes that were `Synced` come back
    /// as `Clean`: nothing has been confirmed with the remote this session.
    pub async fn restore(&self, stored: Vec<StoredNote>) -> Result<usize> {
        let decoded = stored
            .into_iter()
            .map(|s| Ok((codec::from_envelope(&s.record)?, s.state)))
            .collect::<Result<Vec<_>>>()?;
        let count = decoded.len();
        for (note, mut state) in decoded {
            if state.status == NoteStatus::Synced {
                state.status = NoteStatus::Clean;
            }
            let slot = self.slot(note.id());
            *slot.lock().await = Some(Entry { note, state });
        }
        debug!(count, "restored local replica");
        Ok(count)
    }

    // --- Remote operations ---

    /// Push a note's pending edit, returning the version it now has.
    ///
    /// Notes without pending changes are not sent. If the remote already
    /// holds a newer copy, the conflict is settled by last-write-wins: the
    /// remote copy is adopted or the local one is re-pushed on top of it.
    /// Either way the conflict is not an error.
    pub async fn push(&self, session: &Session, id: &NoteId) -> Result<u64> {
        self.push_inner(session, id).await.map(|o| o.version)
    }

    /// Fetch the given notes one after another, lazily, yielding each note
    /// whose local copy was replaced by remote content.
    ///
    /// Notes unchanged since the last pull, notes the remote does not have,
    /// and conflicts won by the local copy yield nothing.
    pub fn pull<'a>(
        &'a self,
        session: &'a Session,
        ids: Vec<NoteId>,
    ) -> impl Stream<Item = Result<Note>> + 'a {
        stream::iter(ids)
            .then(move |id| async move { self.pull_one(session, &id).await })
            .filter_map(|applied| {
                future::ready(match applied {
                    Ok(Applied::Adopted { note, .. }) => Some(Ok(note)),
                    Ok(Applied::Unchanged | Applied::KeptLocal) => None,
                    Err(e) => Some(Err(e)),
                })
            })
    }

    /// Page through the remote listing and reconcile every record,
    /// including notes created on other devices.
    ///
    /// Records that are malformed or do not open under the master key are
    /// logged and skipped; the rest of the listing is still applied.
    pub async fn pull_all(&self, session: &Session) -> Result<Vec<Note>> {
        self.pull_all_inner(session, None)
            .await
            .map(|pulled| pulled.adopted)
    }

    /// Delete a note locally and on the remote. A note the remote never
    /// saw is only dropped locally; a remote 404 counts as success.
    pub async fn delete(&self, session: &Session, id: &NoteId) -> Result<()> {
        let slot = self.existing_slot(id)?;
        let mut guard = slot.lock().await;
        let entry = guard.as_ref().ok_or_else(|| not_found(id))?;
        if entry.state.remote_version > 0 {
            let path = note_path(id);
            match self.call(Method::Delete, &path, session, None).await? {
                Reply::Body(_) | Reply::NotFound => {}
                Reply::Conflict(_) => return Err(unexpected_status(Method::Delete, &path, 409)),
            }
        }
        *guard = None;
        info!(%id, "note deleted");
        Ok(())
    }

    /// One full cycle: push every pending note (up to
    /// `max_concurrent_notes` at a time), then pull the remote listing.
    ///
    /// `cancel` is checked before each per-note operation; a cancelled
    /// cycle stops at the next checkpoint with `ErrorKind::Cancelled`.
    /// Work already finished stays applied.
    pub async fn sync(&self, session: &Session, cancel: &CancellationToken) -> Result<SyncReport> {
        let pending = self.pending_ids().await;
        let mut report = SyncReport::default();

        let outcomes: Vec<Result<PushOutcome>> = stream::iter(pending)
            .map(|id| async move {
                check_cancelled(Some(cancel))?;
                self.push_inner(session, &id)
                    .await
                    .map_err(|e| e.with_context(format!("failed to push note {}", id)))
            })
            .buffer_unordered(self.config.max_concurrent_notes.max(1))
            .collect()
            .await;

        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(outcome) => {
                    report.pushed += usize::from(outcome.sent);
                    report.conflicts_resolved += outcome.conflicts;
                }
                Err(e) => errors.push(e),
            }
        }
        if let Some(pos) = errors.iter().position(|e| e.is(ErrorKind::Auth)) {
            return Err(errors.swap_remove(pos));
        }
        check_cancelled(Some(cancel))?;
        if let Some(e) = errors.into_iter().next() {
            return Err(e);
        }

        let pulled = self.pull_all_inner(session, Some(cancel)).await?;
        report.pulled = pulled.adopted.len();
        report.conflicts_resolved += pulled.conflicts;
        report.skipped = pulled.skipped;

        info!(
            pushed = report.pushed,
            pulled = report.pulled,
            conflicts = report.conflicts_resolved,
            skipped = report.skipped,
            "sync cycle complete"
        );
        Ok(report)
    }

    // --- Internal helpers ---

    fn slot(&self, id: &NoteId) -> Slot {
        self.slots.lock().entry(id.clone()).or_default().clone()
    }

    fn existing_slot(&self, id: &NoteId) -> Result<Slot> {
        self.slots
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    fn all_slots(&self) -> Vec<(NoteId, Slot)> {
        let mut slots: Vec<(NoteId, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    async fn push_inner(&self, session: &Session, id: &NoteId) -> Result<PushOutcome> {
        let slot = self.existing_slot(id)?;
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| not_found(id))?;
        if !entry.state.status.has_pending_changes() {
            return Ok(PushOutcome {
                version: entry.note.version(),
                sent: false,
                conflicts: 0,
            });
        }

        let path = note_path(id);
        let mut conflicts = 0;
        loop {
            entry.note.seal(&self.key)?;
            let body = codec::to_json(&entry.note)?;
            let pushed = entry.note.version();
            debug!(%id, version = pushed, "pushing note");

            let reply = match self.call(Method::Put, &path, session, Some(&body)).await? {
                Reply::Body(echo) => {
                    let version = confirmed_version(id, pushed, &echo)?;
                    entry.note.set_version(version);
                    entry.state.mark_synced(version, Utc::now());
                    return Ok(PushOutcome {
                        version,
                        sent: true,
                        conflicts,
                    });
                }
                Reply::NotFound => return Err(unexpected_status(Method::Put, &path, 404)),
                Reply::Conflict(reply) => reply,
            };

            conflicts += 1;
            if conflicts > self.config.max_conflict_rounds as usize {
                return Err(SealnoteError::with_kind(
                    ErrorCategory::Remote,
                    ErrorKind::SyncFailure,
                    format!("note {} still conflicting after {} pushes", id, conflicts),
                ));
            }

            // The 409 body usually carries the winning record; fetch it otherwise.
            let remote = match codec::from_json(&reply) {
                Ok(remote) if remote.id() == id => remote,
                _ => match self.call(Method::Get, &path, session, None).await? {
                    Reply::Body(body) => decode_note(id, &body)?,
                    // Deleted between the two calls; the next push recreates it.
                    Reply::NotFound => continue,
                    Reply::Conflict(_) => return Err(unexpected_status(Method::Get, &path, 409)),
                },
            };
            warn!(%id, local = pushed, remote = remote.version(), "push conflict");

            match ConflictResolver::resolve(&entry.note, &remote) {
                Resolution::AcceptRemote => {
                    let version = remote.version();
                    self.adopt(entry, remote)?;
                    return Ok(PushOutcome {
                        version,
                        sent: true,
                        conflicts,
                    });
                }
                Resolution::KeepLocal => {
                    let next = pushed.max(next_version(id, remote.version())?);
                    entry.note.set_version(next);
                    entry.state.mark_conflicted(next, remote.version());
                }
            }
        }
    }

    async fn pull_one(&self, session: &Session, id: &NoteId) -> Result<Applied> {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        let path = note_path(id);
        let remote = match self.call(Method::Get, &path, session, None).await? {
            Reply::Body(body) => decode_note(id, &body)?,
            Reply::NotFound => return Ok(Applied::Unchanged),
            Reply::Conflict(_) => return Err(unexpected_status(Method::Get, &path, 409)),
        };
        self.reconcile(&mut guard, remote)
    }

    async fn pull_all_inner(
        &self,
        session: &Session,
        cancel: Option<&CancellationToken>,
    ) -> Result<Pulled> {
        let page_size = self.config.page_size.max(1);
        let mut skip = 0usize;
        let mut pulled = Pulled::default();

        loop {
            check_cancelled(cancel)?;
            let path = format!("/notes/?skip={}&limit={}", skip, page_size);
            let records = match self.call(Method::Get, &path, session, None).await? {
                Reply::Body(body) => codec::from_json_list(&body)?,
                Reply::NotFound => Vec::new(),
                Reply::Conflict(_) => return Err(unexpected_status(Method::Get, &path, 409)),
            };
            let count = records.len();

            for remote in records {
                check_cancelled(cancel)?;
                let remote = match remote {
                    Ok(remote) => remote,
                    Err(e) => {
                        warn!(
                            path = %path,
                            error = %e,
                            "skipping malformed record in remote listing"
                        );
                        pulled.skipped += 1;
                        continue;
                    }
                };
                let id = remote.id().clone();
                let slot = self.slot(&id);
                let mut guard = slot.lock().await;
                match self.reconcile(&mut guard, remote) {
                    Ok(Applied::Adopted { note, conflict }) => {
                        pulled.conflicts += usize::from(conflict);
                        pulled.adopted.push(note);
                    }
                    Ok(Applied::KeptLocal) => pulled.conflicts += 1,
                    Ok(Applied::Unchanged) => {}
                    // One unreadable record must not hold back the rest of the listing.
                    Err(e) if e.is(ErrorKind::Decrypt) || e.is(ErrorKind::MalformedRecord) => {
                        warn!(%id, error = %e, "skipping unusable remote record");
                        pulled.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if count < page_size as usize {
                break;
            }
            skip += count;
        }

        debug!(
            adopted = pulled.adopted.len(),
            conflicts = pulled.conflicts,
            skipped = pulled.skipped,
            "pulled remote listing"
        );
        Ok(pulled)
    }

    /// Apply one remote record to a locked slot.
    fn reconcile(&self, slot: &mut Option<Entry>, remote: Note) -> Result<Applied> {
        if slot.is_none() {
            let note = self.open_remote(remote)?;
            let mut state = SyncState::clean(note.version());
            state.mark_synced(note.version(), Utc::now());
            debug!(id = %note.id(), version = note.version(), "adopted new remote note");
            *slot = Some(Entry {
                note: note.clone(),
                state,
            });
            return Ok(Applied::Adopted {
                note,
                conflict: false,
            });
        }
        let entry = slot
            .as_mut()
            .ok_or_else(|| SealnoteError::invariant("slot emptied while locked"))?;

        // Nothing newer than what we already know: leave state untouched.
        if remote.version() <= entry.state.remote_version {
            return Ok(Applied::Unchanged);
        }

        if !entry.state.status.has_pending_changes() {
            let note = self.adopt(entry, remote)?;
            return Ok(Applied::Adopted {
                note,
                conflict: false,
            });
        }

        entry.note.seal(&self.key)?;
        match ConflictResolver::resolve(&entry.note, &remote) {
            Resolution::AcceptRemote => {
                warn!(id = %remote.id(), remote = remote.version(), "conflict: remote copy wins");
                let note = self.adopt(entry, remote)?;
                Ok(Applied::Adopted {
                    note,
                    conflict: true,
                })
            }
            Resolution::KeepLocal => {
                let next = entry
                    .note
                    .version()
                    .max(next_version(remote.id(), remote.version())?);
                warn!(id = %remote.id(), local = next, "conflict: local copy wins");
                entry.note.set_version(next);
                entry.state.mark_conflicted(next, remote.version());
                Ok(Applied::KeptLocal)
            }
        }
    }

    /// Replace the local copy with a remote one. The remote copy must open
    /// under our key first; on failure the local copy is left as it was.
    fn adopt(&self, entry: &mut Entry, remote: Note) -> Result<Note> {
        let note = self.open_remote(remote)?;
        entry.state.mark_synced(note.version(), Utc::now());
        entry.note = note.clone();
        debug!(id = %note.id(), version = note.version(), "adopted remote copy");
        Ok(note)
    }

    fn open_remote(&self, mut remote: Note) -> Result<Note> {
        remote.open(&self.key)?;
        Ok(remote)
    }

    /// Send one request, retrying transient failures with backoff.
    ///
    /// 2xx, 404 and 409 are returned for the caller to interpret and 401
    /// fails immediately with `Auth`. Everything else (other statuses and
    /// network errors) is retried; once the attempts are used up the last
    /// failure is wrapped in `SyncFailure`.
    async fn call(
        &self,
        method: Method,
        path: &str,
        session: &Session,
        body: Option<&[u8]>,
    ) -> Result<Reply> {
        let attempts = self.config.retry.attempts();
        let mut last_failure = None;

        for attempt in 1..=attempts {
            let failure = match self.transport.send(method, path, session, body).await {
                Ok(resp) if resp.is_success() => return Ok(Reply::Body(resp.body)),
                Ok(resp) => match resp.status {
                    401 => {
                        return Err(SealnoteError::with_kind(
                            ErrorCategory::User,
                            ErrorKind::Auth,
                            format!("{} {} rejected the session token", method, path),
                        ));
                    }
                    404 => return Ok(Reply::NotFound),
                    409 => return Ok(Reply::Conflict(resp.body)),
                    status => SealnoteError::with_kind(
                        ErrorCategory::Remote,
                        ErrorKind::Transport,
                        format!("{} {} returned status {}", method, path, status),
                    ),
                },
                Err(e) => SealnoteError::with_kind_and_source(
                    ErrorCategory::Remote,
                    ErrorKind::Transport,
                    format!("{} {} failed", method, path),
                    e,
                ),
            };

            if attempt < attempts {
                let delay = self.config.retry.backoff(attempt);
                warn!(%method, path, attempt, ?delay, error = %failure, "transport failure, backing off");
                tokio::time::sleep(delay).await;
            }
            last_failure = Some(failure);
        }

        let cause = last_failure
            .unwrap_or_else(|| SealnoteError::invariant("retry loop made no attempt"));
        Err(SealnoteError::with_kind_and_source(
            ErrorCategory::Remote,
            ErrorKind::SyncFailure,
            format!("{} {} failed after {} attempts", method, path, attempts),
            cause,
        ))
    }
}

fn note_path(id: &NoteId) -> String {
    format!("/notes/{}/", id)
}

fn not_found(id: &NoteId) -> SealnoteError {
    SealnoteError::with_kind(
        ErrorCategory::User,
        ErrorKind::NotFound,
        format!("no note with id {}", id),
    )
}

fn unexpected_status(method: Method, path: &str, status: u16) -> SealnoteError {
    SealnoteError::with_kind(
        ErrorCategory::Remote,
        ErrorKind::Transport,
        format!("unexpected status {} for {} {}", status, method, path),
    )
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(SealnoteError::with_kind(
            ErrorCategory::User,
            ErrorKind::Cancelled,
            "sync cancelled",
        ));
    }
    Ok(())
}

fn decode_note(id: &NoteId, body: &[u8]) -> Result<Note> {
    let note = codec::from_json(body)?;
    if note.id() != id {
        return Err(SealnoteError::malformed(format!(
            "asked for note {}, remote answered with {}",
            id,
            note.id()
        )));
    }
    Ok(note)
}

/// Version the remote acknowledged for a successful push. An empty body
/// acknowledges exactly what was sent.
fn confirmed_version(id: &NoteId, pushed: u64, echo: &[u8]) -> Result<u64> {
    if echo.iter().all(u8::is_ascii_whitespace) {
        return Ok(pushed);
    }
    let stored = decode_note(id, echo)?;
    if stored.version() < pushed {
        return Err(SealnoteError::malformed(format!(
            "remote acknowledged version {} of note {} after push of version {}",
            stored.version(),
            id,
            pushed
        )));
    }
    Ok(stored.version())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_paths_use_trailing_slash() {
        assert_eq!(note_path(&NoteId::new("n1").unwrap()), "/notes/n1/");
    }

    #[test]
    fn empty_echo_confirms_pushed_version() {
        let id = NoteId::new("n1").unwrap();
        assert_eq!(confirmed_version(&id, 4, b"").unwrap(), 4);
        assert_eq!(confirmed_version(&id, 4, b" \n").unwrap(), 4);
    }

    #[test]
    fn garbage_echo_is_malformed() {
        let id = NoteId::new("n1").unwrap();
        let err = confirmed_version(&id, 4, b"{\"ok\":true}").unwrap_err();
        assert!(err.is(ErrorKind::MalformedRecord));
    }

    #[test]
    fn cancellation_checkpoint() {
        let token = CancellationToken::new();
        assert!(check_cancelled(None).is_ok());
        assert!(check_cancelled(Some(&token)).is_ok());
        token.cancel();
        assert!(check_cancelled(Some(&token)).unwrap_err().is(ErrorKind::Cancelled));
    }
}
