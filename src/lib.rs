//! Sealnote - end-to-end encrypted notes with a sync engine
//!
//! Notes are sealed with XSalsa20Poly1305 under a master key derived from the
//! user's passphrase (scrypt) before they leave the device. The remote store
//! only ever sees ciphertext plus the metadata needed to order versions.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod codec;
pub mod config;
pub mod error;
pub mod keystore;
pub mod note;
pub mod passphrase;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use error::{ErrorCategory, ErrorKind, Result, SealnoteError};
pub use keystore::{KdfParams, KeyStore, MasterKey};
pub use note::{Note, NoteId};
pub use sync::{SyncEngine, SyncReport};
pub use transport::{HttpTransport, Method, NetworkError, Session, TransportClient, TransportResponse};
