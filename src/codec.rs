//! Wire records: note metadata plus ciphertext, ready for the remote store
//!
//! A record is a flat JSON object:
//!
//! ```text
//! { "id": "n1", "version": 2, "updatedAt": "2024-05-01T10:00:00Z",
//!   "nonce": "<base64>", "ciphertext": "<base64>", "authTag": "<base64>" }
//! ```
//!
//! Binary fields use standard base64 with padding. Plaintext never appears.
//! Decoding is all-or-nothing per record: a record either yields a complete
//! sealed [`Note`] or fails with `MalformedRecord`.

use crate::cipher::{CipherEnvelope, NONCE_LEN, TAG_LEN};
use crate::error::{Result, SealnoteError};
use crate::note::{Note, NoteId};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    pub id: String,
    /// Unsigned, so negative or fractional versions are rejected by the parser.
    pub version: u64,
    pub updated_at: String,
    pub nonce: String,
    pub ciphertext: String,
    pub auth_tag: String,
}

/// Build the wire record for a sealed note.
///
/// The note must already carry an envelope (see [`Note::seal`]); the codec
/// has no key and never encrypts on its own.
pub fn to_envelope(note: &Note) -> Result<WireRecord> {
    let envelope = note.envelope().ok_or_else(|| {
        SealnoteError::invariant(format!("note {} must be sealed before encoding", note.id()))
    })?;
    Ok(WireRecord {
        id: note.id().to_string(),
        version: note.version(),
        updated_at: format_timestamp(note.updated_at()),
        nonce: STANDARD.encode(envelope.nonce),
        ciphertext: STANDARD.encode(&envelope.ciphertext),
        auth_tag: STANDARD.encode(envelope.auth_tag),
    })
}

/// Validate a wire record and turn it into a sealed note.
pub fn from_envelope(record: &WireRecord) -> Result<Note> {
    let id = NoteId::new(record.id.as_str())
        .map_err(|e| SealnoteError::malformed(format!("record has {}", e.message())))?;
    let updated_at = parse_timestamp(&record.updated_at)?;
    let nonce: [u8; NONCE_LEN] = decode_fixed("nonce", &record.nonce)?;
    let auth_tag: [u8; TAG_LEN] = decode_fixed("authTag", &record.auth_tag)?;
    let ciphertext = decode_field("ciphertext", &record.ciphertext)?;

    Ok(Note::sealed(
        id,
        record.version,
        updated_at,
        CipherEnvelope {
            nonce,
            ciphertext,
            auth_tag,
        },
    ))
}

/// Serialize a sealed note to JSON bytes.
pub fn to_json(note: &Note) -> Result<Vec<u8>> {
    let record = to_envelope(note)?;
    serde_json::to_vec(&record)
        .map_err(|e| SealnoteError::invariant(format!("failed to serialize wire record: {}", e)))
}

/// Parse one wire record from JSON bytes.
pub fn from_json(bytes: &[u8]) -> Result<Note> {
    let record: WireRecord = serde_json::from_slice(bytes)
        .map_err(|e| SealnoteError::malformed(format!("invalid wire record: {}", e)))?;
    from_envelope(&record)
}

/// Parse a JSON array of wire records.
///
/// Only the array itself has to be well formed. Each element is decoded on
/// its own, so a bad record yields its own `MalformedRecord` error next to
/// the good ones instead of rejecting the batch.
pub fn from_json_list(bytes: &[u8]) -> Result<Vec<Result<Note>>> {
    let values: Vec<serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| SealnoteError::malformed(format!("invalid wire record list: {}", e)))?;
    Ok(values.into_iter().map(from_value).collect())
}

fn from_value(value: serde_json::Value) -> Result<Note> {
    let record: WireRecord = serde_json::from_value(value)
        .map_err(|e| SealnoteError::malformed(format!("invalid wire record: {}", e)))?;
    from_envelope(&record)
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            SealnoteError::malformed(format!("updatedAt {:?} is not ISO-8601: {}", value, e))
        })
}

fn decode_field(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| SealnoteError::malformed(format!("{} is not valid base64: {}", field, e)))
}

fn decode_fixed<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
    let bytes = decode_field(field, value)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        SealnoteError::malformed(format!("{} must be {} bytes, got {}", field, N, len))
    })
}
