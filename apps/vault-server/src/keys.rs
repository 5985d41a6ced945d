// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Hierarchy
//!
//! Each tenant's content is protected by a random data-encryption key (DEK).
//! The DEK is never stored in plaintext; it is wrapped under a key derived
//! with Argon2id from one of two secret sets:
//!
//! | Mode | Wrapping key input | Who can unwrap |
//! |------|--------------------|----------------|
//! | `legacy` | master secret | server alone |
//! | `split-authority` | master secret ‖ client share | server + tenant together |
//!
//! The client share is handed to the tenant exactly once. The server keeps an
//! HMAC of it (`share_hash`) so a presented share can be checked without ever
//! storing the share itself.
//!
//! Resolved DEKs are memoized in a bounded LRU keyed by `(tenant_id, mode)`
//! because derivation is deliberately expensive.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use argon2::{Algorithm, Argon2, Params, Version};
use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError, DataKey, KEY_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Salt size for wrapping-key derivation.
pub const SALT_LEN: usize = 16;

/// Client share size in bytes before encoding.
pub const SHARE_LEN: usize = 32;

/// Default number of resolved DEKs kept in memory.
pub const DEFAULT_DEK_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("split-authority key requires a client key share")]
    MissingSecretShare,

    #[error("client key share does not match the registered share")]
    ShareMismatch,

    #[error("malformed key record: {0}")]
    MalformedRecord(String),
}

pub type KeyResult<T> = Result<T, KeyError>;

// =============================================================================
// Secrets
// =============================================================================

/// Process-wide server secret. Never persisted.
#[derive(Clone)]
pub struct MasterSecret(Zeroizing<Vec<u8>>);

impl MasterSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret([REDACTED])")
    }
}

/// Tenant-held half of a split-authority key, base64 encoded.
#[derive(Clone)]
pub struct ClientKeyShare(Zeroizing<String>);

impl ClientKeyShare {
    fn generate() -> KeyResult<Self> {
        let mut raw = Zeroizing::new([0u8; SHARE_LEN]);
        crypto::fill_random(&mut raw[..])?;
        Ok(Self(Zeroizing::new(Base64::encode_string(&raw[..]))))
    }

    /// Wrap a share presented by a client.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(Zeroizing::new(encoded.into()))
    }

    /// The encoded form handed to the tenant.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ClientKeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientKeyShare([REDACTED])")
    }
}

// =============================================================================
// Persisted Record
// =============================================================================

/// How a tenant's DEK is wrapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    /// Records written before split authority existed carry no mode field.
    #[default]
    Legacy,
    SplitAuthority,
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionMode::Legacy => f.write_str("legacy"),
            EncryptionMode::SplitAuthority => f.write_str("split-authority"),
        }
    }
}

/// Per-tenant wrapped key, as stored in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDekRecord {
    /// base64(nonce ‖ ciphertext ‖ tag)
    pub encrypted_dek: String,
    /// base64 of the Argon2 salt
    pub dek_salt: String,
    #[serde(default)]
    pub encryption_mode: EncryptionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_hash: Option<String>,
}

/// Freshly generated DEK together with its persistable record.
#[derive(Debug)]
pub struct GeneratedDek {
    pub record: EncryptedDekRecord,
    pub dek: DataKey,
}

/// Split-authority generation result. `client_share` must be returned to the
/// tenant and then dropped.
#[derive(Debug)]
pub struct GeneratedSplitDek {
    pub record: EncryptedDekRecord,
    pub dek: DataKey,
    pub client_share: ClientKeyShare,
}

// =============================================================================
// KDF
// =============================================================================

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// 64 MiB, 3 passes, single lane.
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Minimal cost, for tests only.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Derive a 256-bit key from `secret` and `salt` with Argon2id.
pub fn derive_key(secret: &[u8], salt: &[u8], params: KdfParams) -> KeyResult<DataKey> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| KeyError::Derivation(format!("invalid Argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(secret, salt, &mut out[..])
        .map_err(|e| KeyError::Derivation(format!("Argon2 failed: {e}")))?;
    Ok(DataKey::from_bytes(*out))
}

fn split_input(master: &MasterSecret, share: &ClientKeyShare) -> Zeroizing<Vec<u8>> {
    let mut input = Zeroizing::new(Vec::with_capacity(
        master.as_bytes().len() + share.expose().len(),
    ));
    input.extend_from_slice(master.as_bytes());
    input.extend_from_slice(share.expose().as_bytes());
    input
}

fn share_hash(salt: &[u8], share: &ClientKeyShare) -> KeyResult<String> {
    let mut mac = HmacSha256::new_from_slice(salt)
        .map_err(|e| KeyError::Derivation(format!("HMAC key: {e}")))?;
    mac.update(share.expose().as_bytes());
    Ok(Base64::encode_string(&mac.finalize().into_bytes()))
}

fn decode_field(name: &str, value: &str) -> KeyResult<Vec<u8>> {
    Base64::decode_vec(value).map_err(|e| KeyError::MalformedRecord(format!("{name}: {e}")))
}

// =============================================================================
// KeyManager
// =============================================================================

type DekCacheKey = (String, EncryptionMode);

/// Memoized DEKs plus a counter bumped by every invalidation.
///
/// A resolve that started under an older generation must not populate the
/// cache, or it would reinstate a key that was invalidated while it ran.
struct DekCache {
    entries: LruCache<DekCacheKey, DataKey>,
    generation: u64,
}

/// Derives, wraps, unwraps and memoizes tenant DEKs.
pub struct KeyManager {
    params: KdfParams,
    cache: Mutex<DekCache>,
}

impl KeyManager {
    pub fn new(params: KdfParams, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            params,
            cache: Mutex::new(DekCache {
                entries: LruCache::new(capacity),
                generation: 0,
            }),
        }
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    /// Generate a DEK wrapped under the master secret alone.
    pub fn generate_dek(&self, master: &MasterSecret) -> KeyResult<GeneratedDek> {
        let (dek, salt) = fresh_dek_and_salt()?;
        let wrapping = derive_key(master.as_bytes(), &salt, self.params)?;
        let wrapped = crypto::seal_prefixed(dek.as_bytes(), &wrapping)?;

        Ok(GeneratedDek {
            record: EncryptedDekRecord {
                encrypted_dek: Base64::encode_string(&wrapped),
                dek_salt: Base64::encode_string(&salt),
                encryption_mode: EncryptionMode::Legacy,
                share_hash: None,
            },
            dek,
        })
    }

    /// Generate a DEK wrapped under `master ‖ client_share`.
    pub fn generate_dek_split_authority(
        &self,
        master: &MasterSecret,
    ) -> KeyResult<GeneratedSplitDek> {
        let (dek, salt) = fresh_dek_and_salt()?;
        let client_share = ClientKeyShare::generate()?;
        let wrapping = derive_key(&split_input(master, &client_share), &salt, self.params)?;
        let wrapped = crypto::seal_prefixed(dek.as_bytes(), &wrapping)?;

        Ok(GeneratedSplitDek {
            record: EncryptedDekRecord {
                encrypted_dek: Base64::encode_string(&wrapped),
                dek_salt: Base64::encode_string(&salt),
                encryption_mode: EncryptionMode::SplitAuthority,
                share_hash: Some(share_hash(&salt, &client_share)?),
            },
            dek,
            client_share,
        })
    }

    /// Unwrap a legacy-mode DEK.
    pub fn decrypt_dek(
        &self,
        encrypted_dek: &str,
        dek_salt: &str,
        master: &MasterSecret,
    ) -> KeyResult<DataKey> {
        self.unwrap_with(encrypted_dek, dek_salt, master.as_bytes())
    }

    /// Unwrap a split-authority DEK. Both secrets are required.
    pub fn decrypt_dek_split_authority(
        &self,
        encrypted_dek: &str,
        dek_salt: &str,
        master: &MasterSecret,
        client_share: &ClientKeyShare,
    ) -> KeyResult<DataKey> {
        self.unwrap_with(encrypted_dek, dek_salt, &split_input(master, client_share))
    }

    fn unwrap_with(&self, encrypted_dek: &str, dek_salt: &str, secret: &[u8]) -> KeyResult<DataKey> {
        let wrapped = decode_field("encrypted_dek", encrypted_dek)?;
        let salt = decode_field("dek_salt", dek_salt)?;

        let wrapping = derive_key(secret, &salt, self.params)?;
        let raw = Zeroizing::new(crypto::open_prefixed(&wrapped, &wrapping)?);
        let bytes: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
            KeyError::MalformedRecord(format!("unwrapped DEK has {} bytes", raw.len()))
        })?;
        Ok(DataKey::from_bytes(bytes))
    }

    /// Check a presented share against the record's `share_hash`.
    pub fn verify_share(
        &self,
        record: &EncryptedDekRecord,
        client_share: &ClientKeyShare,
    ) -> KeyResult<()> {
        let Some(expected) = record.share_hash.as_deref() else {
            return Ok(());
        };
        let expected = decode_field("share_hash", expected)?;
        let salt = decode_field("dek_salt", &record.dek_salt)?;

        let mut mac = HmacSha256::new_from_slice(&salt)
            .map_err(|e| KeyError::Derivation(format!("HMAC key: {e}")))?;
        mac.update(client_share.expose().as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| KeyError::ShareMismatch)
    }

    /// Resolve a tenant's DEK, dispatching on the record's mode.
    ///
    /// Results are memoized per `(tenant_id, mode)`. In split-authority mode
    /// the share is required and verified on every call, cached or not.
    pub fn resolve_dek(
        &self,
        tenant_id: &str,
        record: &EncryptedDekRecord,
        master: &MasterSecret,
        client_share: Option<&ClientKeyShare>,
    ) -> KeyResult<DataKey> {
        let mode = record.encryption_mode;
        let share = match mode {
            EncryptionMode::Legacy => None,
            EncryptionMode::SplitAuthority => {
                let share = client_share.ok_or(KeyError::MissingSecretShare)?;
                self.verify_share(record, share)?;
                Some(share)
            }
        };

        let cache_key = (tenant_id.to_string(), mode);
        let generation = match self.cached(&cache_key) {
            Ok(dek) => return Ok(dek),
            Err(generation) => generation,
        };

        let dek = match (mode, share) {
            (EncryptionMode::Legacy, _) => {
                self.decrypt_dek(&record.encrypted_dek, &record.dek_salt, master)?
            }
            (EncryptionMode::SplitAuthority, Some(share)) => self.decrypt_dek_split_authority(
                &record.encrypted_dek,
                &record.dek_salt,
                master,
                share,
            )?,
            (EncryptionMode::SplitAuthority, None) => return Err(KeyError::MissingSecretShare),
        };

        debug!(tenant_id = %tenant_id, mode = %mode, "Resolved tenant DEK");
        self.memoize(generation, cache_key, &dek);
        Ok(dek)
    }

    /// Cached DEK, or the generation a fresh resolve starts under.
    fn cached(&self, key: &DekCacheKey) -> Result<DataKey, Option<u64>> {
        let Ok(mut cache) = self.cache.lock() else {
            return Err(None);
        };
        match cache.entries.get(key) {
            Some(dek) => Ok(dek.clone()),
            None => Err(Some(cache.generation)),
        }
    }

    fn memoize(&self, generation: Option<u64>, key: DekCacheKey, dek: &DataKey) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if generation == Some(cache.generation) {
            cache.entries.put(key, dek.clone());
        } else {
            debug!(tenant_id = %key.0, "Invalidated while resolving; not caching DEK");
        }
    }

    /// Drop memoized DEKs for one tenant, or all of them.
    pub fn invalidate(&self, tenant_id: Option<&str>) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        cache.generation = cache.generation.wrapping_add(1);
        match tenant_id {
            Some(id) => {
                for mode in [EncryptionMode::Legacy, EncryptionMode::SplitAuthority] {
                    cache.entries.pop(&(id.to_string(), mode));
                }
            }
            None => cache.entries.clear(),
        }
    }

    /// Number of memoized DEKs.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.entries.len()).unwrap_or(0)
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new(KdfParams::default(), DEFAULT_DEK_CACHE_CAPACITY)
    }
}

fn fresh_dek_and_salt() -> KeyResult<(DataKey, [u8; SALT_LEN])> {
    let dek = DataKey::generate()?;
    let mut salt = [0u8; SALT_LEN];
    crypto::fill_random(&mut salt)?;
    Ok((dek, salt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> KeyManager {
        KeyManager::new(KdfParams::insecure_fast(), 16)
    }

    fn secret(s: &str) -> MasterSecret {
        MasterSecret::new(s.as_bytes().to_vec())
    }

    #[test]
    fn derive_key_is_deterministic_and_salt_sensitive() {
        let params = KdfParams::insecure_fast();
        let a = derive_key(b"secret", b"0123456789abcdef", params).unwrap();
        let b = derive_key(b"secret", b"0123456789abcdef", params).unwrap();
        let c = derive_key(b"secret", b"fedcba9876543210", params).unwrap();
        let d = derive_key(b"other", b"0123456789abcdef", params).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn generate_then_decrypt_returns_same_dek() {
        let km = manager();
        let generated = km.generate_dek(&secret("secret")).unwrap();
        assert_eq!(generated.record.encryption_mode, EncryptionMode::Legacy);
        assert!(generated.record.share_hash.is_none());

        let dek = km
            .decrypt_dek(
                &generated.record.encrypted_dek,
                &generated.record.dek_salt,
                &secret("secret"),
            )
            .unwrap();
        assert_eq!(dek.as_bytes(), generated.dek.as_bytes());
    }

    #[test]
    fn wrong_master_secret_fails_authentication() {
        let km = manager();
        let generated = km.generate_dek(&secret("secret")).unwrap();

        let result = km.decrypt_dek(
            &generated.record.encrypted_dek,
            &generated.record.dek_salt,
            &secret("not-the-secret"),
        );
        assert!(matches!(
            result,
            Err(KeyError::Crypto(CryptoError::Authentication))
        ));
    }

    #[test]
    fn wrong_salt_fails_authentication() {
        let km = manager();
        let a = km.generate_dek(&secret("secret")).unwrap();
        let b = km.generate_dek(&secret("secret")).unwrap();

        let result = km.decrypt_dek(&a.record.encrypted_dek, &b.record.dek_salt, &secret("secret"));
        assert!(matches!(
            result,
            Err(KeyError::Crypto(CryptoError::Authentication))
        ));
    }

    #[test]
    fn split_authority_roundtrip() {
        let km = manager();
        let generated = km.generate_dek_split_authority(&secret("secret")).unwrap();
        assert_eq!(
            generated.record.encryption_mode,
            EncryptionMode::SplitAuthority
        );
        assert!(generated.record.share_hash.is_some());

        let dek = km
            .decrypt_dek_split_authority(
                &generated.record.encrypted_dek,
                &generated.record.dek_salt,
                &secret("secret"),
                &generated.client_share,
            )
            .unwrap();
        assert_eq!(dek, generated.dek);
    }

    #[test]
    fn split_authority_needs_both_secrets() {
        let km = manager();
        let generated = km.generate_dek_split_authority(&secret("secret")).unwrap();
        let record = &generated.record;

        let wrong_secret = km.decrypt_dek_split_authority(
            &record.encrypted_dek,
            &record.dek_salt,
            &secret("wrong"),
            &generated.client_share,
        );
        assert!(wrong_secret.is_err());

        let other_share = km.generate_dek_split_authority(&secret("secret")).unwrap();
        let wrong_share = km.decrypt_dek_split_authority(
            &record.encrypted_dek,
            &record.dek_salt,
            &secret("secret"),
            &other_share.client_share,
        );
        assert!(wrong_share.is_err());

        let master_only = km.decrypt_dek(&record.encrypted_dek, &record.dek_salt, &secret("secret"));
        assert!(master_only.is_err());
    }

    #[test]
    fn resolve_split_authority_without_share_is_rejected() {
        let km = manager();
        let generated = km.generate_dek_split_authority(&secret("secret")).unwrap();

        let result = km.resolve_dek("t1", &generated.record, &secret("secret"), None);
        assert!(matches!(result, Err(KeyError::MissingSecretShare)));
    }

    #[test]
    fn resolve_rejects_wrong_share_even_when_cached() {
        let km = manager();
        let generated = km.generate_dek_split_authority(&secret("secret")).unwrap();
        let master = secret("secret");

        let dek = km
            .resolve_dek("t1", &generated.record, &master, Some(&generated.client_share))
            .unwrap();
        assert_eq!(dek, generated.dek);
        assert_eq!(km.cached_len(), 1);

        let bogus = ClientKeyShare::from_encoded("bm90LXRoZS1zaGFyZQ==");
        let result = km.resolve_dek("t1", &generated.record, &master, Some(&bogus));
        assert!(matches!(result, Err(KeyError::ShareMismatch)));

        let result = km.resolve_dek("t1", &generated.record, &master, None);
        assert!(matches!(result, Err(KeyError::MissingSecretShare)));
    }

    #[test]
    fn resolve_memoizes_and_invalidate_clears() {
        let km = manager();
        let master = secret("secret");
        let a = km.generate_dek(&master).unwrap();
        let b = km.generate_dek(&master).unwrap();

        assert_eq!(km.resolve_dek("a", &a.record, &master, None).unwrap(), a.dek);
        assert_eq!(km.resolve_dek("b", &b.record, &master, None).unwrap(), b.dek);
        assert_eq!(km.cached_len(), 2);

        // Cached DEK is served even though the record no longer matches
        let served = km.resolve_dek("a", &b.record, &master, None).unwrap();
        assert_eq!(served, a.dek);

        km.invalidate(Some("a"));
        assert_eq!(km.cached_len(), 1);
        assert_eq!(km.resolve_dek("a", &b.record, &master, None).unwrap(), b.dek);

        km.invalidate(None);
        assert_eq!(km.cached_len(), 0);
    }

    #[test]
    fn resolve_overlapping_invalidation_is_not_cached() {
        let km = manager();
        let master = secret("secret");
        let old = km.generate_dek(&master).unwrap();
        let rotated = km.generate_dek(&master).unwrap();
        let key = ("t1".to_string(), EncryptionMode::Legacy);

        // A resolve misses the cache, then the tenant is invalidated before it finishes
        let started = km.cached(&key).unwrap_err();
        km.invalidate(Some("t1"));
        km.memoize(started, key.clone(), &old.dek);
        assert_eq!(km.cached_len(), 0);

        // The next resolve sees the rotated record and caches it
        let dek = km.resolve_dek("t1", &rotated.record, &master, None).unwrap();
        assert_eq!(dek, rotated.dek);
        assert_eq!(km.cached_len(), 1);

        // A resolve that saw no invalidation still memoizes
        let other = ("t2".to_string(), EncryptionMode::Legacy);
        let started = km.cached(&other).unwrap_err();
        km.memoize(started, other, &old.dek);
        assert_eq!(km.cached_len(), 2);
    }

    #[test]
    fn legacy_resolve_ignores_supplied_share() {
        let km = manager();
        let master = secret("secret");
        let generated = km.generate_dek(&master).unwrap();
        let share = ClientKeyShare::from_encoded("irrelevant");

        let dek = km
            .resolve_dek("t1", &generated.record, &master, Some(&share))
            .unwrap();
        assert_eq!(dek, generated.dek);
    }

    #[test]
    fn malformed_record_is_reported() {
        let km = manager();
        let result = km.decrypt_dek("not base64!!", "AAAA", &secret("secret"));
        assert!(matches!(result, Err(KeyError::MalformedRecord(_))));
    }

    #[test]
    fn record_serializes_with_persisted_field_names() {
        let km = manager();
        let generated = km.generate_dek_split_authority(&secret("secret")).unwrap();
        let json = serde_json::to_value(&generated.record).unwrap();

        assert_eq!(json["encryption_mode"], "split-authority");
        assert!(json["encrypted_dek"].is_string());
        assert!(json["dek_salt"].is_string());
        assert!(json["share_hash"].is_string());

        let legacy: EncryptedDekRecord =
            serde_json::from_str(r#"{"encrypted_dek":"AA==","dek_salt":"AA=="}"#).unwrap();
        assert_eq!(legacy.encryption_mode, EncryptionMode::Legacy);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let km = manager();
        let generated = km.generate_dek_split_authority(&secret("hunter2")).unwrap();
        assert!(!format!("{:?}", secret("hunter2")).contains("hunter2"));
        assert!(!format!("{generated:?}").contains(generated.client_share.expose()));
    }
}
