//! At-rest encryption of key material and canonical serialization.
//!
//! The private half of every keypair is serialized, sealed with
//! AES-256-GCM under a PBKDF2-SHA512 password-derived key, and stored next
//! to its cleartext public half. Each sealed record embeds its salt and
//! iteration count; records minted on another device open with the same
//! vault password. Decryption failure is reported as `InvalidPassword`
//! with no distinction between a wrong password and a tampered file.

use chrono::Utc;
use uuid::Uuid;
use zeroize::Zeroizing;

use onestar_core::error::{Result, VaultError};
use onestar_core::hybrid::{self, HybridKeypair};
use onestar_core::primitives;

use crate::model::{
    KEYSTORE_ALGORITHM, KEYSTORE_VERSION, Keystore, RotationHistoryEntry, RotationTrigger,
    SCHEMA_VERSION, StoredKeypair, VaultSettings,
};

/// Memoizes PBKDF2 outputs per (salt, iterations) while a password is in
/// hand. Records sealed on one device share a salt, so an unlock that
/// opens the current keypair and ten retired ones usually runs the KDF
/// once.
pub struct KdfCache {
    entries: Vec<([u8; 32], u32, Zeroizing<[u8; 32]>)>,
}

impl KdfCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Derive (or reuse) the master key for a (salt, iterations) pair.
    pub fn derive(
        &mut self,
        password: &str,
        salt: &[u8; 32],
        iterations: u32,
    ) -> Zeroizing<[u8; 32]> {
        if let Some((_, _, key)) = self
            .entries
            .iter()
            .find(|(s, i, _)| s == salt && *i == iterations)
        {
            return key.clone();
        }
        let key = primitives::pbkdf2_sha512(password.as_bytes(), salt, iterations);
        self.entries.push((*salt, iterations, key.clone()));
        key
    }
}

impl Default for KdfCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Seal a keypair's private half for storage. The record's `key_id` is bound
/// in as AAD so a blob cannot be transplanted between records.
pub fn encrypt_keypair(
    keypair: &HybridKeypair,
    master_key: &[u8; 32],
    salt: &[u8; 32],
    iterations: u32,
) -> Result<StoredKeypair> {
    let plaintext = Zeroizing::new(serde_json::to_vec(&keypair.private)?);
    let iv = primitives::random_array::<12>();
    let (encrypted_keypair, auth_tag) =
        primitives::aes_gcm_seal(master_key, &iv, keypair.key_id.as_bytes(), &plaintext)?;

    Ok(StoredKeypair {
        encrypted_keypair,
        salt: *salt,
        iterations,
        iv,
        auth_tag,
        public: keypair.public.clone(),
        key_id: keypair.key_id,
        created_at: keypair.created_at,
    })
}

/// Open a stored keypair with an already-derived master key. Any failure —
/// wrong password, flipped ciphertext byte, transplanted blob — comes back
/// as `InvalidPassword`; the cause goes to the internal log only.
pub fn decrypt_keypair(stored: &StoredKeypair, master_key: &[u8; 32]) -> Result<HybridKeypair> {
    let plaintext = primitives::aes_gcm_open(
        master_key,
        &stored.iv,
        stored.key_id.as_bytes(),
        &stored.encrypted_keypair,
        &stored.auth_tag,
    )
    .map(Zeroizing::new)
    .map_err(|e| {
        tracing::debug!(key_id = %stored.key_id, cause = %e, "keypair decryption failed");
        VaultError::InvalidPassword
    })?;

    let private = serde_json::from_slice(&plaintext).map_err(|e| {
        tracing::debug!(key_id = %stored.key_id, cause = %e, "keypair record malformed");
        VaultError::InvalidPassword
    })?;

    Ok(HybridKeypair {
        public: stored.public.clone(),
        private,
        key_id: stored.key_id,
        created_at: stored.created_at,
    })
}

/// Open a stored keypair with the vault password, deriving through `cache`.
pub fn decrypt_keypair_with_password(
    stored: &StoredKeypair,
    password: &str,
    cache: &mut KdfCache,
) -> Result<HybridKeypair> {
    let master_key = cache.derive(password, &stored.salt, stored.iterations);
    decrypt_keypair(stored, &master_key)
}

/// Decrypt the current keypair of a keystore with the given password.
/// Doubles as password verification for mutating paths.
pub fn decrypt_current(keystore: &Keystore, password: &str) -> Result<HybridKeypair> {
    let mut cache = KdfCache::new();
    decrypt_keypair_with_password(&keystore.current_keypair, password, &mut cache)
}

/// Decrypt the current keypair and every retained retired keypair.
///
/// The current keypair must open (that is the password check). A retired
/// record that fails to open is logged and skipped rather than blocking the
/// unlock; fallback decryption simply lacks that generation.
pub fn decrypt_all(
    keystore: &Keystore,
    password: &str,
) -> Result<(HybridKeypair, Vec<HybridKeypair>)> {
    let mut cache = KdfCache::new();
    let current = decrypt_keypair_with_password(&keystore.current_keypair, password, &mut cache)?;

    let mut previous = Vec::with_capacity(keystore.previous_keypairs.len());
    for retired in &keystore.previous_keypairs {
        match decrypt_keypair_with_password(&retired.keypair, password, &mut cache) {
            Ok(kp) => previous.push(kp),
            Err(_) => {
                tracing::warn!(
                    key_id = %retired.keypair.key_id,
                    "retired keypair failed to open; fallback will skip it"
                );
            }
        }
    }
    Ok((current, previous))
}

/// Build a brand-new keystore around a freshly generated keypair. Returns
/// the keystore together with the decrypted keypair so the caller can hold
/// it resident without a second KDF run.
pub fn create_keystore(
    password: &str,
    user_id: Option<Uuid>,
    device_name: &str,
    iterations: u32,
) -> Result<(Keystore, HybridKeypair)> {
    let salt = primitives::random_array::<32>();
    let master_key = primitives::pbkdf2_sha512(password.as_bytes(), &salt, iterations);

    let keypair = hybrid::generate_keypair()?;
    let stored = encrypt_keypair(&keypair, &master_key, &salt, iterations)?;

    let now = Utc::now();
    let device_id = Uuid::now_v7();

    let keystore = Keystore {
        version: KEYSTORE_VERSION.to_string(),
        algorithm: KEYSTORE_ALGORITHM.to_string(),
        user_id: user_id.unwrap_or_else(Uuid::now_v7),
        pbkdf2_iterations: iterations,
        password_salt: salt,
        current_keypair: stored,
        previous_keypairs: Vec::new(),
        rotation_history: vec![RotationHistoryEntry {
            rotation_id: Uuid::now_v7(),
            timestamp: now,
            old_key_id: keypair.key_id,
            new_key_id: keypair.key_id,
            reason: "initial".to_string(),
            media_rewrapped: 0,
            duration_ms: 0,
            triggered_by: RotationTrigger::Manual,
            device_id,
        }],
        device_id,
        device_name: device_name.to_string(),
        device_created_at: now,
        last_synced_at: None,
        sync_history: Vec::new(),
        biometric_profile: None,
        vault_settings: VaultSettings::default(),
        created_at: now,
        last_modified: now,
        schema_version: SCHEMA_VERSION,
    };

    Ok((keystore, keypair))
}

/// Canonical JSON: object keys sorted, no insignificant whitespace. Used
/// wherever bytes are hashed, signed or compared (export signatures,
/// rollback equality).
pub fn canonical_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let tree = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&tree)?)
}
