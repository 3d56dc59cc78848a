//! Notes and their identifiers

use crate::cipher::{self, CipherEnvelope};
use crate::error::{ErrorCategory, ErrorKind, Result, SealnoteError};
use crate::keystore::MasterKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Stable note identifier shared by every device and the remote store.
///
/// Restricted to `[A-Za-z0-9._-]` because it is used verbatim as a URL
/// path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NoteId(String);

impl NoteId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if !valid {
            return Err(SealnoteError::with_kind(
                ErrorCategory::User,
                ErrorKind::MalformedRecord,
                format!("invalid note id {:?}", id),
            ));
        }
        Ok(Self(id))
    }

    /// A fresh random identifier for a note created on this device.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NoteId {
    type Err = SealnoteError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for NoteId {
    type Error = SealnoteError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<NoteId> for String {
    fn from(id: NoteId) -> Self {
        id.0
    }
}

/// A note in either or both of its representations.
///
/// At least one of plaintext and envelope is always present. The envelope
/// can always be produced from the plaintext plus the master key; the
/// reverse needs the key as well. Plaintext only ever lives in memory.
#[derive(Clone)]
pub struct Note {
    id: NoteId,
    version: u64,
    updated_at: DateTime<Utc>,
    plaintext: Option<Zeroizing<Vec<u8>>>,
    envelope: Option<CipherEnvelope>,
}

impl Note {
    /// A note freshly written on this device. Starts at version 1.
    pub fn new(id: NoteId, plaintext: impl Into<Vec<u8>>) -> Self {
        Self::with_timestamp(id, 1, Utc::now(), plaintext)
    }

    pub fn with_timestamp(
        id: NoteId,
        version: u64,
        updated_at: DateTime<Utc>,
        plaintext: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            version,
            updated_at,
            plaintext: Some(Zeroizing::new(plaintext.into())),
            envelope: None,
        }
    }

    /// A note as received from the remote store: ciphertext only.
    pub fn sealed(
        id: NoteId,
        version: u64,
        updated_at: DateTime<Utc>,
        envelope: CipherEnvelope,
    ) -> Self {
        Self {
            id,
            version,
            updated_at,
            plaintext: None,
            envelope: Some(envelope),
        }
    }

    pub fn id(&self) -> &NoteId {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Plaintext if this note has been opened (or was written locally).
    pub fn plaintext(&self) -> Option<&[u8]> {
        self.plaintext.as_deref().map(Vec::as_slice)
    }

    /// Ciphertext if this note has been sealed (or came from the remote).
    pub fn envelope(&self) -> Option<&CipherEnvelope> {
        self.envelope.as_ref()
    }

    /// Replace the content. Bumps the version, advances `updated_at` and
    /// drops the now stale envelope. Fails, leaving the note untouched, when
    /// the version cannot be bumped any further.
    pub fn edit(&mut self, plaintext: impl Into<Vec<u8>>) -> Result<()> {
        self.version = next_version(&self.id, self.version)?;
        // Never move backwards, even if the wall clock does.
        self.updated_at = Utc::now().max(self.updated_at);
        self.plaintext = Some(Zeroizing::new(plaintext.into()));
        self.envelope = None;
        Ok(())
    }

    /// Produce the envelope if it is missing.
    pub fn seal(&mut self, key: &MasterKey) -> Result<&CipherEnvelope> {
        if self.envelope.is_none() {
            let plaintext = self
                .plaintext
                .as_ref()
                .ok_or_else(|| SealnoteError::invariant("note has neither plaintext nor envelope"))?;
            self.envelope = Some(cipher::encrypt(plaintext, key)?);
        }
        self.envelope
            .as_ref()
            .ok_or_else(|| SealnoteError::invariant("note envelope vanished while sealing"))
    }

    /// Recover the plaintext if it is missing. Fails with `Decrypt` when the
    /// envelope does not authenticate under `key`; the note is left untouched.
    pub fn open(&mut self, key: &MasterKey) -> Result<&[u8]> {
        if self.plaintext.is_none() {
            let envelope = self
                .envelope
                .as_ref()
                .ok_or_else(|| SealnoteError::invariant("note has neither plaintext nor envelope"))?;
            let plaintext = cipher::decrypt(envelope, key)
                .map_err(|e| e.with_context(format!("failed to open note {}", self.id)))?;
            self.plaintext = Some(plaintext);
        }
        self.plaintext()
            .ok_or_else(|| SealnoteError::invariant("note plaintext vanished while opening"))
    }

    /// Drop the in-memory plaintext. Refused (returns false) while there is
    /// no envelope to fall back to.
    pub fn forget_plaintext(&mut self) -> bool {
        if self.envelope.is_none() {
            return false;
        }
        self.plaintext = None;
        true
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// The version following `version`. A note already at `u64::MAX` has no
/// successor, which only a hostile or broken remote can bring about.
pub(crate) fn next_version(id: &NoteId, version: u64) -> Result<u64> {
    version.checked_add(1).ok_or_else(|| {
        SealnoteError::malformed(format!(
            "note {} is at version {} and cannot advance",
            id, version
        ))
    })
}

impl fmt::Debug for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Note")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("updated_at", &self.updated_at)
            .field("has_plaintext", &self.plaintext.is_some())
            .field("has_envelope", &self.envelope.is_some())
            .finish()
    }
}
