//! Last-Write-Wins conflict resolution.

use crate::note::Note;
use std::cmp::{Ordering, Reverse};

/// Conflict resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Accept the remote note; the local edit is discarded.
    AcceptRemote,
    /// Keep the local note; it will be pushed over the remote one.
    KeepLocal,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve a conflict between the local and remote copy of a note.
    ///
    /// LWW rules:
    /// 1. Later `updated_at` wins.
    /// 2. On equal timestamps, the lexicographically smaller id wins.
    /// 3. If still equal, the smaller ciphertext (then nonce) wins, so the
    ///    outcome never depends on which side is asking.
    pub fn resolve(local: &Note, remote: &Note) -> Resolution {
        match Self::compare(local, remote) {
            Ordering::Greater => Resolution::AcceptRemote,
            Ordering::Less | Ordering::Equal => Resolution::KeepLocal,
        }
    }

    /// The winning note of the pair. Symmetric: argument order is irrelevant.
    pub fn winner<'a>(a: &'a Note, b: &'a Note) -> &'a Note {
        if Self::compare(a, b) == Ordering::Greater {
            b
        } else {
            a
        }
    }

    /// `Less` means `a` wins.
    fn compare(a: &Note, b: &Note) -> Ordering {
        Self::rank(a).cmp(&Self::rank(b))
    }

    fn rank(note: &Note) -> (Reverse<chrono::DateTime<chrono::Utc>>, &str, &[u8], &[u8]) {
        let (ciphertext, nonce) = note
            .envelope()
            .map(|e| (e.ciphertext.as_slice(), e.nonce.as_slice()))
            .unwrap_or_default();
        (Reverse(note.updated_at()), note.id().as_str(), ciphertext, nonce)
    }
}
