//! Authenticated encryption of note payloads using XSalsa20Poly1305
//!
//! Every call to [`encrypt`] draws a fresh 192-bit nonce from the OS RNG.
//! At that size random nonces can be used for the lifetime of a key
//! without a realistic chance of collision, so no counter has to be
//! persisted. The Poly1305 tag is kept detached so the wire record can
//! carry nonce, ciphertext and tag as separate fields.

use crate::error::{ErrorCategory, ErrorKind, Result, SealnoteError};
use crate::keystore::MasterKey;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, Zeroizing};

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// One sealed payload. Self-describing: given the right key, nothing else
/// is needed to recover the plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_LEN],
}

/// Encrypt plaintext under the master key with a random nonce
pub fn encrypt(plaintext: &[u8], key: &MasterKey) -> Result<CipherEnvelope> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    encrypt_with_nonce(plaintext, key, &nonce)
}

/// Encrypt plaintext under the master key using the provided nonce
///
/// This function is ONLY for testing purposes to generate deterministic output.
/// NEVER use this in production - reusing a nonce under the same key destroys
/// confidentiality. Always use `encrypt()` which generates a random nonce.
pub fn encrypt_with_nonce(
    plaintext: &[u8],
    key: &MasterKey,
    nonce: &[u8; NONCE_LEN],
) -> Result<CipherEnvelope> {
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(key.as_bytes()));

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&Nonce::from(*nonce), b"", &mut buffer)
        .map_err(|e| {
            buffer.zeroize();
            SealnoteError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                format!("encryption failed: {}", e),
            )
        })?;

    let mut auth_tag = [0u8; TAG_LEN];
    auth_tag.copy_from_slice(tag.as_slice());

    Ok(CipherEnvelope {
        nonce: *nonce,
        ciphertext: buffer,
        auth_tag,
    })
}

/// Decrypt an envelope, verifying its tag first.
///
/// Fails closed: on any mismatch the caller gets `ErrorKind::Decrypt` and
/// no bytes at all.
pub fn decrypt(envelope: &CipherEnvelope, key: &MasterKey) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(key.as_bytes()));

    let mut buffer = Zeroizing::new(envelope.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            &Nonce::from(envelope.nonce),
            b"",
            &mut buffer,
            GenericArray::from_slice(&envelope.auth_tag),
        )
        .map_err(|_| {
            SealnoteError::with_kind(
                ErrorCategory::User,
                ErrorKind::Decrypt,
                "corrupt input, tampered-with data, or wrong key",
            )
        })?;

    Ok(buffer)
}
