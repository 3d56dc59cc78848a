//! On-disk layout of a local replica
//!
//! A store directory holds three files:
//!
//! - `keystore.json`: salt and KDF parameters (see [`crate::keystore`])
//! - `notes.json`: sealed notes with their sync bookkeeping
//! - `config.toml`: optional settings (see [`crate::config`])
//!
//! Plaintext never reaches the disk. Every write goes through
//! [`write_file_atomic`], so a crash leaves either the old or the new file
//! in place, never a partial one.

use crate::codec::WireRecord;
use crate::error::{ErrorCategory, ErrorKind, Result, SealnoteError};
use crate::sync::SyncState;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const NOTES_FORMAT: u32 = 1;

/// One persisted note: the sealed wire record plus its sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNote {
    pub record: WireRecord,
    pub state: SyncState,
}

#[derive(Serialize, Deserialize)]
struct NotesFile {
    format: u32,
    notes: Vec<StoredNote>,
}

pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the store directory (owner-only on Unix) if it is missing.
    pub fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            SealnoteError::io(format!("failed to create {}", self.dir.display()), e)
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700)).map_err(|e| {
                SealnoteError::io(
                    format!("failed to restrict permissions of {}", self.dir.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.dir.join("keystore.json")
    }

    pub fn notes_path(&self) -> PathBuf {
        self.dir.join("notes.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.toml")
    }

    /// Load persisted notes. A store without `notes.json` is simply empty.
    pub fn load_notes(&self) -> Result<Vec<StoredNote>> {
        let path = self.notes_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SealnoteError::io(format!("failed to read {}", path.display()), e)),
        };
        let file: NotesFile = serde_json::from_slice(&bytes).map_err(|e| {
            SealnoteError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::MalformedRecord,
                format!("{} is not a valid notes file", path.display()),
                e,
            )
        })?;
        if file.format != NOTES_FORMAT {
            return Err(SealnoteError::with_kind(
                ErrorCategory::User,
                ErrorKind::MalformedRecord,
                format!("unsupported notes file format {}", file.format),
            ));
        }
        debug!(count = file.notes.len(), path = %path.display(), "loaded notes");
        Ok(file.notes)
    }

    pub fn save_notes(&self, notes: Vec<StoredNote>) -> Result<()> {
        let file = NotesFile {
            format: NOTES_FORMAT,
            notes,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| {
            SealnoteError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "failed to serialize notes",
                e,
            )
        })?;
        write_file_atomic(&self.notes_path(), &json)?;
        debug!(count = file.notes.len(), "saved notes");
        Ok(())
    }
}

/// Replace `path` with `contents` atomically (tempfile + fsync + rename).
///
/// The file ends up with mode 0o600 on Unix.
pub fn write_file_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        Some(_) => Path::new("."),
        None => {
            return Err(SealnoteError::with_kind(
                ErrorCategory::User,
                ErrorKind::Io,
                format!("{} has no parent directory", path.display()),
            ));
        }
    };
    let mut temp_file = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        SealnoteError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to create tempfile in {}", dir.display()),
            e,
        )
    })?;

    temp_file
        .write_all(contents)
        .map_err(|e| SealnoteError::io("failed to write to tempfile", e))?;
    // Flush and fsync() such that the rename later, if it succeeds, will
    // always point to a valid file.
    temp_file
        .flush()
        .map_err(|e| SealnoteError::io("failed to flush tempfile", e))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| SealnoteError::io("failed to sync file prior to rename", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| SealnoteError::io("failed to set tempfile permissions", e))?;
    }

    temp_file.persist(path).map_err(|e| {
        SealnoteError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to rename to target file {}", path.display()),
            e,
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NoteStatus;
    use tempfile::TempDir;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn stored(id: &str, status: NoteStatus) -> StoredNote {
        let mut state = SyncState::local(2);
        state.status = status;
        StoredNote {
            record: WireRecord {
                id: id.to_string(),
                version: 2,
                updated_at: "2024-05-01T10:00:00Z".to_string(),
                nonce: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
                ciphertext: "c2VjcmV0".to_string(),
                auth_tag: "AAAAAAAAAAAAAAAAAAAAAA==".to_string(),
            },
            state,
        }
    }

    #[test]
    fn test_missing_notes_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path());
        assert!(store.load_notes().unwrap().is_empty());
    }

    #[test]
    fn test_notes_survive_reload() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().join("replica"));
        store.create_dir().unwrap();

        let notes = vec![
            stored("n1", NoteStatus::Synced),
            stored("n2", NoteStatus::LocallyModified),
        ];
        store.save_notes(notes.clone()).unwrap();
        assert_eq!(store.load_notes().unwrap(), notes);
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.json");
        write_file_atomic(&path, b"first").unwrap();
        write_file_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No stray tempfiles left behind.
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_garbage_notes_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path());
        fs::write(store.notes_path(), b"[1, 2, 3]").unwrap();
        assert!(store.load_notes().unwrap_err().is(ErrorKind::MalformedRecord));

        fs::write(store.notes_path(), br#"{"format": 9, "notes": []}"#).unwrap();
        assert!(store.load_notes().unwrap_err().is(ErrorKind::MalformedRecord));
    }

    #[test]
    fn test_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nope").join("file.json");
        let err = write_file_atomic(&path, b"x").unwrap_err();
        assert!(err.is(ErrorKind::Io));
    }

    #[test]
    #[cfg(unix)]
    fn test_file_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().join("replica"));
        store.create_dir().unwrap();
        store.save_notes(vec![stored("n1", NoteStatus::Clean)]).unwrap();

        let mode = fs::metadata(store.notes_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let mode = fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
