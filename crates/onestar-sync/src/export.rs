//! Authenticated keystore export for user-owned device transfer.
//!
//! The payload is the syncable subset only; keypair blobs stay in their
//! at-rest ciphertext form (the receiving device opens them with the vault
//! password it already knows). Two keys are derived from the export
//! password under distinct salts: one signs, one encrypts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use zeroize::Zeroizing;

use onestar_core::error::{Result, VaultError};
use onestar_core::primitives;
use onestar_keystore::codec;
use onestar_keystore::model::{SyncKind, SyncRecord};
use onestar_vault::{Vault, VaultEvent};

use crate::format::{
    EXPORT_ENC, EXPORT_FORMAT, EXPORT_ITERATIONS, EXPORT_KDF, ExportFile, MIN_EXPORT_PASSWORD_LEN,
    SignedPayload, SyncPayload,
};

#[derive(Debug, Clone)]
pub struct ExportResult {
    pub path: PathBuf,
    pub keypairs_exported: u32,
    pub rotations_exported: u32,
    /// SHA-256 of the payload signature, as recorded in sync history.
    pub signature_hash: Vec<u8>,
}

/// Export the vault's syncable state to `output_path`, sealed under
/// `password`. The vault must be unlocked; the export password is confirmed
/// and length-checked before any key derivation runs.
pub async fn export(
    vault: &Arc<Vault>,
    password: &str,
    confirm_password: &str,
    output_path: &Path,
) -> Result<ExportResult> {
    if password != confirm_password {
        return Err(VaultError::WeakPassword(
            "confirmation does not match".into(),
        ));
    }
    if password.chars().count() < MIN_EXPORT_PASSWORD_LEN {
        return Err(VaultError::WeakPassword(format!(
            "shorter than {MIN_EXPORT_PASSWORD_LEN} characters"
        )));
    }

    let mut keystore = vault.keystore().await?;
    let payload = SyncPayload::from_keystore(&keystore);
    let keypairs_exported = 1 + payload.previous_keypairs.len() as u32;
    let rotations_exported = payload.rotation_history.len() as u32;

    let salt_sig = primitives::random_array::<32>();
    let salt_enc = primitives::random_array::<32>();

    let pw = Zeroizing::new(password.to_owned());
    let (signature_key, encryption_key) = tokio::task::spawn_blocking(move || {
        let sig = primitives::pbkdf2_sha512(pw.as_bytes(), &salt_sig, EXPORT_ITERATIONS);
        let enc = primitives::pbkdf2_sha512(pw.as_bytes(), &salt_enc, EXPORT_ITERATIONS);
        (sig, enc)
    })
    .await
    .map_err(|e| VaultError::PrimitiveFailure(format!("blocking task failed: {e}")))?;

    let canonical = codec::canonical_json(&payload)?;
    let checksum = primitives::sha256(&canonical);
    let signature = primitives::hmac_sha256(signature_key.as_ref(), &canonical)?;

    let signed = SignedPayload {
        payload,
        checksum,
        signature,
    };
    let plaintext = serde_json::to_vec(&signed)?;

    let iv = primitives::random_array::<12>();
    let (ciphertext, auth_tag) = primitives::aes_gcm_seal(&encryption_key, &iv, &[], &plaintext)?;

    let wrapper = ExportFile {
        format: EXPORT_FORMAT.to_string(),
        kdf: EXPORT_KDF.to_string(),
        iter: EXPORT_ITERATIONS,
        enc: EXPORT_ENC.to_string(),
        salt_enc,
        salt_sig,
        iv,
        auth_tag,
        ciphertext,
    };
    std::fs::write(output_path, serde_json::to_vec_pretty(&wrapper)?)?;

    // Record the transfer so a bounce-back of this very file is caught as
    // a replay.
    let signature_hash = primitives::sha256(&signature).to_vec();
    keystore.sync_history.push(SyncRecord {
        sync_id: Uuid::now_v7(),
        timestamp: Utc::now(),
        source_device_id: keystore.device_id,
        target_device_id: keystore.device_id,
        kind: SyncKind::Export,
        keypairs_updated: false,
        previous_merged: 0,
        rotations_merged: 0,
        conflicts_resolved: 0,
        signature_hash: signature_hash.clone(),
    });
    keystore.last_modified = Utc::now();
    vault.store().atomic_save(&keystore)?;
    vault.refresh_keystore_cache(keystore).await;

    tracing::info!(
        path = %output_path.display(),
        keypairs = keypairs_exported,
        rotations = rotations_exported,
        "keystore exported"
    );
    vault.events().emit(VaultEvent::ExportComplete {
        path: output_path.to_path_buf(),
    });

    Ok(ExportResult {
        path: output_path.to_path_buf(),
        keypairs_exported,
        rotations_exported,
        signature_hash,
    })
}
