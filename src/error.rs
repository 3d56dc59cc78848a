use std::error::Error as StdError;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// In particular this means that use of Internal is never a guarantee
    /// the error is not, for example due to a user error - merely that it
    /// cannot be confidently determined by the code.
    Internal,

    /// The user provided invalid input (wrong passphrase, bad note id,
    /// missing file) or asked for something impossible to complete.
    User,

    /// The remote store or the network path to it misbehaved.
    Remote,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad credentials: rejected bearer token, empty passphrase, or an
    /// operation that needs the master key while the key store is locked.
    Auth,
    /// Authentication tag mismatch. Either the data was tampered with or
    /// it was sealed under a different key. No plaintext is ever returned.
    Decrypt,
    /// A wire record is missing fields or carries values of the wrong shape.
    MalformedRecord,
    /// A transient network or backend failure.
    Transport,
    /// Transport failures persisted past the configured attempt limit.
    SyncFailure,
    /// A sync cycle was cancelled at a per-note checkpoint.
    Cancelled,
    /// scrypt rejected its parameters or failed to derive a key.
    KeyDerivation,
    /// Passphrase could not be obtained from the configured reader.
    PassphraseUnavailable,
    /// The requested note does not exist locally.
    NotFound,
    /// Unexpected state reached within sealnote logic.
    InternalInvariant,
    /// Interaction with the filesystem, stdin/stdout, or other I/O failed.
    Io,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct SealnoteError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl SealnoteError {
    /// Creates a new error with a required category and display message.
    pub fn new(category: ErrorCategory, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: None,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorCategory::Remote, ErrorKind::MalformedRecord, msg)
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorCategory::Internal, ErrorKind::InternalInvariant, msg)
    }

    /// Tags an I/O failure. A missing file is the user's to fix; anything
    /// else is reported as internal.
    pub fn io(msg: impl Into<String>, source: std::io::Error) -> Self {
        let category = if source.kind() == std::io::ErrorKind::NotFound {
            ErrorCategory::User
        } else {
            ErrorCategory::Internal
        };
        Self::with_kind_and_source(category, ErrorKind::Io, msg, source)
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// True when the error carries the given kind tag.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == Some(kind)
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SealnoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_kind_and_category() {
        let err = SealnoteError::with_kind(ErrorCategory::User, ErrorKind::Decrypt, "tag mismatch")
            .with_context("failed to open note n1");

        assert_eq!(err.category, ErrorCategory::User);
        assert!(err.is(ErrorKind::Decrypt));
        assert_eq!(err.message(), "failed to open note n1");
        assert_eq!(err.source_error().unwrap().to_string(), "tag mismatch");
    }

    #[test]
    fn test_io_not_found_is_user_error() {
        let err = SealnoteError::io(
            "failed to read keystore.json",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert_eq!(err.category, ErrorCategory::User);
        assert!(err.is(ErrorKind::Io));

        let err = SealnoteError::io(
            "failed to read keystore.json",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.category, ErrorCategory::Internal);
    }

    #[test]
    fn test_untagged_error_has_no_kind() {
        let err = SealnoteError::new(ErrorCategory::Internal, "something odd");
        assert_eq!(err.kind, None);
        assert!(!err.is(ErrorKind::Io));
        assert!(err.source_error().is_none());
    }
}
