// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authenticated Encryption
//!
//! AES-256-GCM primitives (ring) used to protect tenant content fields and to
//! wrap data-encryption keys.
//!
//! ## Wire Formats
//!
//! ```text
//! detached:  ciphertext ‖ tag            (nonce stored in its own column)
//! prefixed:  nonce ‖ ciphertext ‖ tag    (fields without a nonce column)
//! ```
//!
//! Nonces are 96 bits and freshly random for every call. Tags are 128 bits.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key size in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Nonce size in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Authentication tag size in bytes (128 bits).
pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Tag mismatch: wrong key, wrong nonce, or tampered bytes.
    #[error("authentication failed")]
    Authentication,

    #[error("invalid key material")]
    InvalidKey,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("random number generator failure")]
    Rng,

    #[error("encryption failed")]
    Seal,
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// A 256-bit symmetric key (zeroized on drop).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_LEN],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Generate a fresh random key.
    pub fn generate() -> CryptoResult<Self> {
        let mut bytes = [0u8; KEY_LEN];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    fn aead_key(&self) -> CryptoResult<LessSafeKey> {
        let unbound =
            UnboundKey::new(&AES_256_GCM, &self.bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        ring::constant_time::verify_slices_are_equal(&self.bytes, &other.bytes).is_ok()
    }
}

impl Eq for DataKey {}

/// Fill `buf` from the system CSPRNG.
pub fn fill_random(buf: &mut [u8]) -> CryptoResult<()> {
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Rng)
}

/// Output of [`encrypt`]: `ciphertext ‖ tag` plus the nonce used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &DataKey) -> CryptoResult<Sealed> {
    let aead = key.aead_key()?;

    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;

    let mut in_out = plaintext.to_vec();
    aead.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| CryptoError::Seal)?;

    Ok(Sealed {
        ciphertext: in_out,
        nonce,
    })
}

/// Decrypt `ciphertext ‖ tag` under `key` and `nonce`.
///
/// The tag is verified before any plaintext is returned.
pub fn decrypt(ciphertext: &[u8], nonce: &[u8], key: &DataKey) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Malformed(format!(
            "ciphertext shorter than tag: {} bytes",
            ciphertext.len()
        )));
    }
    let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| {
        CryptoError::Malformed(format!(
            "invalid nonce size: expected {NONCE_LEN}, got {}",
            nonce.len()
        ))
    })?;

    let aead = key.aead_key()?;
    let mut in_out = ciphertext.to_vec();
    let plaintext_len = aead
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Authentication)?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

/// Encrypt into the self-contained `nonce ‖ ciphertext ‖ tag` format.
pub fn seal_prefixed(plaintext: &[u8], key: &DataKey) -> CryptoResult<Vec<u8>> {
    let sealed = encrypt(plaintext, key)?;
    let mut blob = Vec::with_capacity(NONCE_LEN + sealed.ciphertext.len());
    blob.extend_from_slice(&sealed.nonce);
    blob.extend_from_slice(&sealed.ciphertext);
    Ok(blob)
}

/// Inverse of [`seal_prefixed`].
pub fn open_prefixed(blob: &[u8], key: &DataKey) -> CryptoResult<Vec<u8>> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Malformed(format!(
            "prefixed blob too short: {} bytes",
            blob.len()
        )));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    decrypt(ciphertext, nonce, key)
}

// =============================================================================
// Record Encryption
// =============================================================================

/// Plaintext view of the encryption-relevant fields of a vault entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainRecord {
    /// Primary content body.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

/// Stored row: primary field with a dedicated nonce column, optional fields
/// carrying their own nonce prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    #[serde(with = "b64")]
    pub content: Vec<u8>,
    #[serde(with = "b64")]
    pub content_nonce: Vec<u8>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub title: Option<Vec<u8>>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<u8>>,
}

/// Encrypt every field of `record` independently.
pub fn encrypt_record(record: &PlainRecord, key: &DataKey) -> CryptoResult<EncryptedRecord> {
    let primary = encrypt(record.content.as_bytes(), key)?;
    let title = record
        .title
        .as_deref()
        .map(|t| seal_prefixed(t.as_bytes(), key))
        .transpose()?;
    let tags = record
        .tags
        .as_deref()
        .map(|t| seal_prefixed(t.as_bytes(), key))
        .transpose()?;

    Ok(EncryptedRecord {
        content: primary.ciphertext,
        content_nonce: primary.nonce.to_vec(),
        title,
        tags,
    })
}

/// Decrypt a stored row back into its plaintext fields.
pub fn decrypt_record(row: &EncryptedRecord, key: &DataKey) -> CryptoResult<PlainRecord> {
    let content = decrypt(&row.content, &row.content_nonce, key)?;
    let title = row
        .title
        .as_deref()
        .map(|blob| open_prefixed(blob, key).and_then(into_utf8))
        .transpose()?;
    let tags = row
        .tags
        .as_deref()
        .map(|blob| open_prefixed(blob, key).and_then(into_utf8))
        .transpose()?;

    Ok(PlainRecord {
        content: into_utf8(content)?,
        title,
        tags,
    })
}

fn into_utf8(bytes: Vec<u8>) -> CryptoResult<String> {
    String::from_utf8(bytes).map_err(|e| CryptoError::Malformed(format!("invalid UTF-8: {e}")))
}

/// Base64 (standard, padded) serde adapters for binary columns.
pub(crate) mod b64 {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&Base64::encode_string(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        Base64::decode_vec(&encoded).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod b64_opt {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&Base64::encode_string(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| Base64::decode_vec(&encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
