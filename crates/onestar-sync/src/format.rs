//! Transfer-file formats: the encrypted wrapper and the signed payload it
//! seals. The payload carries the syncable subset of a keystore only —
//! `password_salt`, `biometric_profile` and `vault_settings` never appear
//! in any export.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use onestar_core::encoding::{b64, b64_arr};
use onestar_core::error::{Result, VaultError};
use onestar_keystore::model::{Keystore, RetiredKeypair, RotationHistoryEntry, StoredKeypair};

/// Magic tag of the wrapper.
pub const EXPORT_FORMAT: &str = "onestar-keystore-export-v1";
pub const EXPORT_KDF: &str = "PBKDF2-SHA512";
pub const EXPORT_ENC: &str = "AES-256-GCM";
/// KDF cost for transfer files. Lower than the at-rest floor: the export
/// password is typed twice and the file is short-lived.
pub const EXPORT_ITERATIONS: u32 = 100_000;
/// Minimum export password length.
pub const MIN_EXPORT_PASSWORD_LEN: usize = 12;

/// Outer, unencrypted wrapper as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFile {
    pub format: String,
    pub kdf: String,
    pub iter: u32,
    pub enc: String,
    #[serde(with = "b64_arr")]
    pub salt_enc: [u8; 32],
    #[serde(with = "b64_arr")]
    pub salt_sig: [u8; 32],
    #[serde(with = "b64_arr")]
    pub iv: [u8; 12],
    #[serde(with = "b64_arr")]
    pub auth_tag: [u8; 16],
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

impl ExportFile {
    /// Structural checks before any key derivation is spent on the file.
    pub fn validate(&self) -> Result<()> {
        if self.format != EXPORT_FORMAT {
            tracing::debug!(format = %self.format, "unknown transfer format");
            return Err(VaultError::Corrupted);
        }
        if self.kdf != EXPORT_KDF || self.enc != EXPORT_ENC {
            tracing::debug!(kdf = %self.kdf, enc = %self.enc, "unknown transfer algorithms");
            return Err(VaultError::Corrupted);
        }
        if self.iter < EXPORT_ITERATIONS {
            tracing::debug!(iter = self.iter, "transfer KDF cost below floor");
            return Err(VaultError::Corrupted);
        }
        Ok(())
    }
}

/// The syncable subset of a keystore; what signatures and checksums cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPayload {
    pub user_id: Uuid,
    pub current_keypair: StoredKeypair,
    pub previous_keypairs: Vec<RetiredKeypair>,
    pub rotation_history: Vec<RotationHistoryEntry>,
    pub device_id: Uuid,
    pub device_name: String,
}

impl SyncPayload {
    pub fn from_keystore(keystore: &Keystore) -> Self {
        Self {
            user_id: keystore.user_id,
            current_keypair: keystore.current_keypair.clone(),
            previous_keypairs: keystore.previous_keypairs.clone(),
            rotation_history: keystore.rotation_history.clone(),
            device_id: keystore.device_id,
            device_name: keystore.device_name.clone(),
        }
    }
}

/// Payload plus its integrity attachments, as sealed inside the wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPayload {
    #[serde(flatten)]
    pub payload: SyncPayload,
    #[serde(with = "b64_arr")]
    pub checksum: [u8; 32],
    #[serde(with = "b64_arr")]
    pub signature: [u8; 32],
}
