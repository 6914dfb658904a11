//! Keystore records, version 4.
//!
//! The at-rest form carries only ciphertext, IVs, salts and auth tags for
//! key material; plaintext private halves never touch disk. Device-local
//! fields (`password_salt`, `biometric_profile`, `vault_settings`) never
//! cross the export boundary — the sync codec builds its payload from the
//! syncable subset only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use onestar_core::encoding::{b64, b64_arr};
use onestar_core::error::{Result, VaultError};
use onestar_core::hybrid::HybridPublicKey;

/// Current on-disk format tag.
pub const KEYSTORE_VERSION: &str = "v4";
/// Algorithm suite label carried in the file for forensic clarity.
pub const KEYSTORE_ALGORITHM: &str = "ML-KEM-768 + X25519 + AES-256-GCM";
/// Current schema number.
pub const SCHEMA_VERSION: u32 = 4;
/// Floor for the at-rest KDF.
pub const MIN_PBKDF2_ITERATIONS: u32 = 600_000;
/// Retired keypairs retained for fallback decryption.
pub const MAX_PREVIOUS_KEYPAIRS: usize = 10;

/// A keypair in its at-rest form: public half in the clear, private half
/// sealed under the password-derived key. Each record carries the salt and
/// iteration count it was sealed with, so any device that knows the vault
/// password can open it — sync ships these records as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    #[serde(with = "b64")]
    pub encrypted_keypair: Vec<u8>,
    #[serde(with = "b64_arr")]
    pub salt: [u8; 32],
    pub iterations: u32,
    #[serde(with = "b64_arr")]
    pub iv: [u8; 12],
    #[serde(with = "b64_arr")]
    pub auth_tag: [u8; 16],
    pub public: HybridPublicKey,
    pub key_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A demoted keypair. Decryption-only; never wraps new material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredKeypair {
    #[serde(flatten)]
    pub keypair: StoredKeypair,
    pub retired_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationTrigger {
    Automatic,
    Manual,
    SecurityEvent,
}

/// One committed rotation. `old_key_id == new_key_id` only on the
/// keystore-creation entry (reason `"initial"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationHistoryEntry {
    pub rotation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub old_key_id: Uuid,
    pub new_key_id: Uuid,
    pub reason: String,
    pub media_rewrapped: u32,
    pub duration_ms: u32,
    pub triggered_by: RotationTrigger,
    pub device_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Export,
    Import,
}

/// Audit record of one export or import performed by this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub sync_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_device_id: Uuid,
    pub target_device_id: Uuid,
    pub kind: SyncKind,
    pub keypairs_updated: bool,
    pub previous_merged: u32,
    pub rotations_merged: u32,
    pub conflicts_resolved: u32,
    #[serde(with = "b64")]
    pub signature_hash: Vec<u8>,
}

/// Device-local lock behavior. These knobs alter when the vault locks,
/// never the password policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSettings {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    #[serde(default)]
    pub lock_on_sleep: bool,
    #[serde(default)]
    pub lock_on_screen_lock: bool,
    #[serde(default)]
    pub lock_on_minimize: bool,
    #[serde(default)]
    pub lock_on_window_blur: bool,
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_min_password_length() -> usize {
    16
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            min_password_length: default_min_password_length(),
            lock_on_sleep: true,
            lock_on_screen_lock: true,
            lock_on_minimize: false,
            lock_on_window_blur: false,
        }
    }
}

/// The persistent, password-encrypted container of a user's keys and audit
/// history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keystore {
    pub version: String,
    pub algorithm: String,
    pub user_id: Uuid,
    pub pbkdf2_iterations: u32,
    #[serde(with = "b64_arr")]
    pub password_salt: [u8; 32],
    pub current_keypair: StoredKeypair,
    /// Ordered newest → oldest by retirement time.
    pub previous_keypairs: Vec<RetiredKeypair>,
    /// Chronological, non-decreasing per device.
    pub rotation_history: Vec<RotationHistoryEntry>,
    pub device_id: Uuid,
    pub device_name: String,
    pub device_created_at: DateTime<Utc>,
    pub last_synced_at: Option<i64>,
    pub sync_history: Vec<SyncRecord>,
    pub biometric_profile: Option<serde_json::Value>,
    pub vault_settings: VaultSettings,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub schema_version: u32,
}

impl Keystore {
    /// Structural invariants enforced on every load and before every save.
    pub fn validate(&self) -> Result<()> {
        if self.version != KEYSTORE_VERSION {
            return Err(VaultError::CorruptKeystore(format!(
                "unexpected version tag {}",
                self.version
            )));
        }
        if self.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(VaultError::CorruptKeystore(format!(
                "pbkdf2_iterations {} below floor",
                self.pbkdf2_iterations
            )));
        }
        if self
            .previous_keypairs
            .iter()
            .any(|p| p.keypair.key_id == self.current_keypair.key_id)
        {
            return Err(VaultError::CorruptKeystore(
                "current keypair also present in previous_keypairs".into(),
            ));
        }
        if self.previous_keypairs.len() > MAX_PREVIOUS_KEYPAIRS {
            return Err(VaultError::CorruptKeystore(format!(
                "{} retired keypairs exceeds cap",
                self.previous_keypairs.len()
            )));
        }
        if self
            .previous_keypairs
            .windows(2)
            .any(|w| w[0].retired_at < w[1].retired_at)
        {
            return Err(VaultError::CorruptKeystore(
                "previous_keypairs not ordered newest first".into(),
            ));
        }
        // Per-device history must be chronological.
        let mut last_per_device: std::collections::HashMap<Uuid, DateTime<Utc>> =
            std::collections::HashMap::new();
        for entry in &self.rotation_history {
            if let Some(prev) = last_per_device.get(&entry.device_id) {
                if entry.timestamp < *prev {
                    return Err(VaultError::CorruptKeystore(
                        "rotation_history timestamps regress for a device".into(),
                    ));
                }
            }
            last_per_device.insert(entry.device_id, entry.timestamp);
        }
        if !self.rotation_history.is_empty()
            && !self
                .rotation_history
                .iter()
                .any(|e| e.new_key_id == self.current_keypair.key_id)
        {
            return Err(VaultError::CorruptKeystore(
                "current keypair is unknown to rotation_history".into(),
            ));
        }
        Ok(())
    }

    /// The retired entry holding `key_id`, if still retained.
    pub fn find_previous(&self, key_id: Uuid) -> Option<&RetiredKeypair> {
        self.previous_keypairs
            .iter()
            .find(|p| p.keypair.key_id == key_id)
    }

    /// Age of the current keypair in whole days.
    pub fn current_keypair_age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.current_keypair.created_at).num_days()
    }

    /// True if a sync signature hash was already recorded on this device.
    pub fn has_seen_signature(&self, signature_hash: &[u8]) -> bool {
        self.sync_history
            .iter()
            .any(|r| r.signature_hash == signature_hash)
    }
}
