//! Master key derivation and lifecycle
//!
//! The master key is derived with scrypt from the user's passphrase and a
//! per-account salt. The salt and the scrypt work factor are persisted in a
//! small JSON header next to the notes; the key itself never leaves memory.
//!
//! Derivation always succeeds and yields *some* key, so a wrong passphrase
//! can only surface as a failed decryption. To catch it before any note is
//! sealed under the wrong key, the first unlock seals a fixed check value
//! into the header; later unlocks must open it.

use crate::cipher::{self, CipherEnvelope, NONCE_LEN, TAG_LEN};
use crate::error::{ErrorCategory, ErrorKind, Result, SealnoteError};
use crate::store;
use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use rand::rngs::OsRng;
use scrypt::{Params, scrypt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Length of salt in bytes
pub const SALT_LEN: usize = 16;

/// Length of derived key in bytes
pub const KEY_LEN: usize = 32;

/// Version of the on-disk key store header
const HEADER_FORMAT: u32 = 1;

/// Plaintext of the check value sealed into the header.
const KEY_CHECK: &[u8] = b"sealnote key check v1";

/// scrypt work factor.
///
/// The defaults (N = 2^15, r = 8, p = 1) cost roughly 100ms on a laptop.
/// Stores remember the parameters they were created with, so raising the
/// defaults never locks anyone out of an existing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// log2 of the scrypt N parameter (CPU/memory cost)
    pub log_n: u8,
    /// scrypt r parameter (block size)
    pub r: u32,
    /// scrypt p parameter (parallelization)
    pub p: u32,
}

impl KdfParams {
    pub const fn new(log_n: u8, r: u32, p: u32) -> Self {
        Self { log_n, r, p }
    }

    fn to_scrypt(self) -> Result<Params> {
        Params::new(self.log_n, self.r, self.p, KEY_LEN).map_err(|e| {
            SealnoteError::with_kind(
                ErrorCategory::User,
                ErrorKind::KeyDerivation,
                format!("invalid scrypt parameters {:?}: {}", self, e),
            )
        })
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::new(15, 8, 1)
    }
}

/// Per-account salt. Not secret, but must stay stable for the life of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    pub const fn from_bytes(bytes: [u8; SALT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }
}

/// Symmetric key all notes are sealed under.
///
/// Cloning is cheap and shares the same zeroizing allocation, so a single
/// derived key can be handed to any number of concurrent cipher calls
/// without locking. The bytes are wiped when the last clone is dropped.
#[derive(Clone)]
pub struct MasterKey(Arc<Zeroizing<[u8; KEY_LEN]>>);

impl MasterKey {
    /// Wraps raw key material. Callers that derive keys elsewhere (an OS
    /// keychain, a hardware token) can plug them in here.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Arc::new(Zeroizing::new(bytes)))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Derive the master key from a passphrase and salt using scrypt
pub fn derive_key(passphrase: &[u8], salt: &Salt, params: KdfParams) -> Result<MasterKey> {
    let scrypt_params = params.to_scrypt()?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    scrypt(passphrase, salt.as_bytes(), &scrypt_params, &mut *key).map_err(|e| {
        SealnoteError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::KeyDerivation,
            format!("scrypt key derivation failed: {}", e),
        )
    })?;
    Ok(MasterKey(Arc::new(key)))
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyStoreHeader {
    format: u32,
    salt: String,
    kdf: KdfParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    check: Option<KeyCheck>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyCheck {
    nonce: String,
    ciphertext: String,
    auth_tag: String,
}

impl KeyCheck {
    fn encode(envelope: &CipherEnvelope) -> Self {
        Self {
            nonce: STANDARD.encode(envelope.nonce),
            ciphertext: STANDARD.encode(&envelope.ciphertext),
            auth_tag: STANDARD.encode(envelope.auth_tag),
        }
    }

    fn decode(&self) -> Result<CipherEnvelope> {
        let corrupt = || {
            SealnoteError::with_kind(
                ErrorCategory::User,
                ErrorKind::MalformedRecord,
                "key store check value is corrupt",
            )
        };
        let nonce: [u8; NONCE_LEN] = STANDARD
            .decode(&self.nonce)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(corrupt)?;
        let auth_tag: [u8; TAG_LEN] = STANDARD
            .decode(&self.auth_tag)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(corrupt)?;
        let ciphertext = STANDARD.decode(&self.ciphertext).map_err(|_| corrupt())?;
        Ok(CipherEnvelope {
            nonce,
            ciphertext,
            auth_tag,
        })
    }
}

/// Owns the salt, the KDF parameters and, while unlocked, the master key.
#[derive(Debug)]
pub struct KeyStore {
    salt: Salt,
    params: KdfParams,
    check: Option<CipherEnvelope>,
    key: Option<MasterKey>,
}

impl KeyStore {
    /// Start a new account: a fresh random salt with the given work factor.
    pub fn create(params: KdfParams) -> Result<Self> {
        params.to_scrypt()?;
        Ok(Self::from_parts(Salt::generate(), params))
    }

    pub fn from_parts(salt: Salt, params: KdfParams) -> Self {
        Self {
            salt,
            params,
            check: None,
            key: None,
        }
    }

    /// Load the salt and parameters persisted by [`KeyStore::save`]. The
    /// store starts out locked.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| SealnoteError::io(format!("failed to read {}", path.display()), e))?;
        let header: KeyStoreHeader = serde_json::from_slice(&bytes).map_err(|e| {
            SealnoteError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::MalformedRecord,
                format!("{} is not a valid key store header", path.display()),
                e,
            )
        })?;
        if header.format != HEADER_FORMAT {
            return Err(SealnoteError::with_kind(
                ErrorCategory::User,
                ErrorKind::MalformedRecord,
                format!("unsupported key store format {}", header.format),
            ));
        }
        let salt: [u8; SALT_LEN] = STANDARD
            .decode(&header.salt)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                SealnoteError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::MalformedRecord,
                    format!("key store salt must be {} base64-encoded bytes", SALT_LEN),
                )
            })?;
        header.kdf.to_scrypt()?;
        let check = header.check.as_ref().map(KeyCheck::decode).transpose()?;
        Ok(Self {
            check,
            ..Self::from_parts(Salt(salt), header.kdf)
        })
    }

    /// Persist salt and parameters (never the key) atomically with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        let header = KeyStoreHeader {
            format: HEADER_FORMAT,
            salt: STANDARD.encode(self.salt.as_bytes()),
            kdf: self.params,
            check: self.check.as_ref().map(KeyCheck::encode),
        };
        let json = serde_json::to_vec_pretty(&header).map_err(|e| {
            SealnoteError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "failed to serialize key store header",
                e,
            )
        })?;
        store::write_file_atomic(path, &json)
    }

    /// Derive the master key and hold it for the rest of the session.
    ///
    /// The derived key must open the store's check value; otherwise the
    /// unlock fails with `Decrypt` and the store stays as it was. A store
    /// without one gets it sealed under this key, to be persisted by the
    /// next [`KeyStore::save`]. Unlocking an already unlocked store
    /// re-derives and replaces the key.
    pub fn unlock(&mut self, passphrase: &[u8]) -> Result<MasterKey> {
        if passphrase.is_empty() {
            return Err(SealnoteError::with_kind(
                ErrorCategory::User,
                ErrorKind::Auth,
                "empty passphrase",
            ));
        }
        debug!(log_n = self.params.log_n, "deriving master key");
        let key = derive_key(passphrase, &self.salt, self.params)?;
        match &self.check {
            Some(check) => {
                cipher::decrypt(check, &key)
                    .map_err(|e| e.with_context("passphrase does not open this key store"))?;
            }
            None => self.check = Some(cipher::encrypt(KEY_CHECK, &key)?),
        }
        self.key = Some(key.clone());
        info!("key store unlocked");
        Ok(key)
    }

    /// Drop this store's reference to the key. Clones still held by
    /// running engines keep it alive until they are dropped too.
    pub fn lock(&mut self) {
        if self.key.take().is_some() {
            info!("key store locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    /// True once a passphrase has been bound to this store.
    pub fn has_key_check(&self) -> bool {
        self.check.is_some()
    }

    /// The current master key, or an `Auth` error while locked.
    pub fn master_key(&self) -> Result<MasterKey> {
        self.key.clone().ok_or_else(|| {
            SealnoteError::with_kind(ErrorCategory::User, ErrorKind::Auth, "key store is locked")
        })
    }

    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FAST: KdfParams = KdfParams::new(4, 8, 1);

    #[test]
    fn test_same_passphrase_same_key() {
        let salt = Salt::from_bytes([7u8; SALT_LEN]);
        let k1 = derive_key(b"hunter2", &salt, FAST).unwrap();
        let k2 = derive_key(b"hunter2", &salt, FAST).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_salt_and_passphrase_change_key() {
        let salt = Salt::from_bytes([7u8; SALT_LEN]);
        let other_salt = Salt::from_bytes([8u8; SALT_LEN]);
        let base = derive_key(b"hunter2", &salt, FAST).unwrap();
        assert_ne!(
            base.as_bytes(),
            derive_key(b"hunter3", &salt, FAST).unwrap().as_bytes()
        );
        assert_ne!(
            base.as_bytes(),
            derive_key(b"hunter2", &other_salt, FAST).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_unlock_and_lock() {
        let mut ks = KeyStore::create(FAST).unwrap();
        assert!(!ks.is_unlocked());
        assert!(ks.master_key().unwrap_err().is(ErrorKind::Auth));

        let key = ks.unlock(b"passphrase").unwrap();
        assert!(ks.is_unlocked());
        assert_eq!(ks.master_key().unwrap().as_bytes(), key.as_bytes());

        ks.lock();
        assert!(!ks.is_unlocked());
        assert!(ks.master_key().unwrap_err().is(ErrorKind::Auth));
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let mut ks = KeyStore::create(FAST).unwrap();
        let err = ks.unlock(b"").unwrap_err();
        assert!(err.is(ErrorKind::Auth));
        assert!(!ks.is_unlocked());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let err = KeyStore::create(KdfParams::new(0, 0, 0)).unwrap_err();
        assert!(err.is(ErrorKind::KeyDerivation));
    }

    #[test]
    fn test_save_load_keeps_salt_and_params() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keystore.json");

        let mut original = KeyStore::create(FAST).unwrap();
        let key = original.unlock(b"passphrase").unwrap();
        original.save(&path).unwrap();

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("\"salt\""));

        let mut loaded = KeyStore::load(&path).unwrap();
        assert!(!loaded.is_unlocked());
        assert_eq!(loaded.salt(), original.salt());
        assert_eq!(loaded.params(), FAST);
        assert_eq!(
            loaded.unlock(b"passphrase").unwrap().as_bytes(),
            key.as_bytes()
        );
    }

    #[test]
    fn test_wrong_passphrase_rejected_after_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keystore.json");

        let mut original = KeyStore::create(FAST).unwrap();
        assert!(!original.has_key_check());
        original.unlock(b"right").unwrap();
        assert!(original.has_key_check());
        original.save(&path).unwrap();

        let mut loaded = KeyStore::load(&path).unwrap();
        assert!(loaded.has_key_check());
        let err = loaded.unlock(b"wrnog").unwrap_err();
        assert!(err.is(ErrorKind::Decrypt));
        assert!(!loaded.is_unlocked());
        assert!(loaded.unlock(b"right").is_ok());
    }

    #[test]
    fn test_header_without_check_is_bound_on_unlock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keystore.json");
        std::fs::write(
            &path,
            br#"{"format":1,"salt":"AAAAAAAAAAAAAAAAAAAAAA==","kdf":{"log_n":4,"r":8,"p":1}}"#,
        )
        .unwrap();

        let mut ks = KeyStore::load(&path).unwrap();
        assert!(!ks.has_key_check());
        ks.unlock(b"first").unwrap();
        ks.save(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"authTag\""));

        let mut reloaded = KeyStore::load(&path).unwrap();
        assert!(reloaded.unlock(b"second").unwrap_err().is(ErrorKind::Decrypt));
    }

    #[test]
    fn test_load_rejects_corrupt_check() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keystore.json");
        std::fs::write(
            &path,
            br#"{"format":1,"salt":"AAAAAAAAAAAAAAAAAAAAAA==","kdf":{"log_n":4,"r":8,"p":1},
                "check":{"nonce":"AAAA","ciphertext":"","authTag":"AAAA"}}"#,
        )
        .unwrap();

        let err = KeyStore::load(&path).unwrap_err();
        assert!(err.is(ErrorKind::MalformedRecord));
    }

    #[test]
    fn test_load_rejects_bad_salt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keystore.json");
        std::fs::write(
            &path,
            br#"{"format":1,"salt":"AAAA","kdf":{"log_n":4,"r":8,"p":1}}"#,
        )
        .unwrap();

        let err = KeyStore::load(&path).unwrap_err();
        assert!(err.is(ErrorKind::MalformedRecord));
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = KeyStore::load(&temp_dir.path().join("nope.json")).unwrap_err();
        assert!(err.is(ErrorKind::Io));
        assert_eq!(err.category, ErrorCategory::User);
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = MasterKey::from_bytes([0x41; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "MasterKey(..)");
    }
}
