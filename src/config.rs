//! Runtime configuration, read from an optional TOML file.

use crate::error::{ErrorCategory, ErrorKind, Result, SealnoteError};
use crate::keystore::KdfParams;
use crate::sync::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the remote note store, e.g. `https://notes.example.com/api`.
    pub server_url: Option<String>,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Upper bound on notes synced in parallel during a full cycle.
    pub max_concurrent_notes: usize,
    /// Records requested per page when listing the remote store.
    pub page_size: u32,
    /// How many times a push that lost a race is re-attempted after the
    /// conflict was resolved in the local note's favour.
    pub max_conflict_rounds: u32,
    /// Work factor for newly created key stores.
    pub kdf: KdfParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            request_timeout_secs: 30,
            retry: RetryPolicy::default(),
            max_concurrent_notes: 4,
            page_size: 100,
            max_conflict_rounds: 3,
            kdf: KdfParams::default(),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(SealnoteError::io(
                    format!("failed to read {}", path.display()),
                    e,
                ));
            }
        };
        toml::from_str(&content).map_err(|e| {
            SealnoteError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::MalformedRecord,
                format!("invalid config file {}", path.display()),
                e,
            )
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
