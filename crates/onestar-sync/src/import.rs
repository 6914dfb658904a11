//! Import of an authenticated transfer file, with the full validation
//! chain: format → decrypt → signature → checksum → identity → downgrade →
//! replay → merge → persist.
//!
//! A wrong password and a flipped ciphertext byte are indistinguishable to
//! the caller; signature and checksum failures are distinct because they
//! prove possession of the password and therefore leak nothing new.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use zeroize::Zeroizing;

use onestar_core::error::{Result, VaultError};
use onestar_core::primitives;
use onestar_keystore::codec;
use onestar_keystore::model::{Keystore, SyncKind, SyncRecord};
use onestar_vault::{Vault, VaultEvent, VaultState};

use crate::format::{ExportFile, SignedPayload};
use crate::merge;

#[derive(Debug, Clone)]
pub struct ImportResult {
    pub keypairs_updated: bool,
    pub previous_merged: u32,
    pub rotations_merged: u32,
    pub conflicts_resolved: u32,
}

/// Import a transfer file into this device's keystore. Works against the
/// on-disk keystore whether or not the vault is unlocked; when the import
/// changes keypair state while unlocked, the vault locks itself so the
/// next unlock decrypts the merged reality.
pub async fn import(vault: &Arc<Vault>, file_path: &Path, password: &str) -> Result<ImportResult> {
    let raw = std::fs::read(file_path)?;
    let wrapper: ExportFile = serde_json::from_slice(&raw).map_err(|e| {
        tracing::debug!(cause = %e, "transfer wrapper unparseable");
        VaultError::Corrupted
    })?;
    wrapper.validate()?;

    let pw = Zeroizing::new(password.to_owned());
    let salt_enc = wrapper.salt_enc;
    let salt_sig = wrapper.salt_sig;
    let iterations = wrapper.iter;
    let (encryption_key, signature_key) = tokio::task::spawn_blocking(move || {
        let enc = primitives::pbkdf2_sha512(pw.as_bytes(), &salt_enc, iterations);
        let sig = primitives::pbkdf2_sha512(pw.as_bytes(), &salt_sig, iterations);
        (enc, sig)
    })
    .await
    .map_err(|e| VaultError::PrimitiveFailure(format!("blocking task failed: {e}")))?;

    let plaintext = primitives::aes_gcm_open(
        &encryption_key,
        &wrapper.iv,
        &[],
        &wrapper.ciphertext,
        &wrapper.auth_tag,
    )
    .map_err(|e| {
        tracing::debug!(cause = %e, "transfer file failed to open");
        VaultError::InvalidPassword
    })?;

    let signed: SignedPayload = serde_json::from_slice(&plaintext).map_err(|e| {
        tracing::debug!(cause = %e, "transfer payload unparseable");
        VaultError::Corrupted
    })?;

    // Recompute the HMAC over the canonical payload; compare in constant
    // time. Then the plain checksum, which catches corruption that predates
    // signing.
    let canonical = codec::canonical_json(&signed.payload)?;
    let expected_signature = primitives::hmac_sha256(signature_key.as_ref(), &canonical)?;
    if !primitives::ct_eq(&expected_signature, &signed.signature) {
        tracing::warn!("transfer signature mismatch");
        return Err(VaultError::Tampered);
    }
    let expected_checksum = primitives::sha256(&canonical);
    if expected_checksum != signed.checksum {
        tracing::warn!("transfer checksum mismatch");
        return Err(VaultError::Corrupted);
    }

    let local = vault.store().load()?;
    let payload = signed.payload;

    if payload.user_id != local.user_id {
        tracing::warn!(
            imported = %payload.user_id,
            local = %local.user_id,
            "transfer belongs to another identity"
        );
        return Err(VaultError::IdentityMismatch);
    }

    check_downgrade(&local, &payload.rotation_history)?;

    let signature_hash = primitives::sha256(&signed.signature).to_vec();
    if local.has_seen_signature(&signature_hash) {
        tracing::warn!("transfer already imported");
        return Err(VaultError::Replay);
    }

    let now = Utc::now();
    let outcome = merge::merge(&local, &payload, now)?;
    let mut merged = outcome.keystore;

    merged.sync_history.push(SyncRecord {
        sync_id: Uuid::now_v7(),
        timestamp: now,
        source_device_id: payload.device_id,
        target_device_id: merged.device_id,
        kind: SyncKind::Import,
        keypairs_updated: outcome.keypairs_updated,
        previous_merged: outcome.previous_merged,
        rotations_merged: outcome.rotations_merged,
        conflicts_resolved: outcome.conflicts_resolved,
        signature_hash,
    });
    merged.last_synced_at = Some(now.timestamp_millis());
    merged.last_modified = now;

    vault.store().atomic_save(&merged)?;

    if vault.state().await == VaultState::Unlocked {
        if outcome.keypairs_updated {
            // Resident keys no longer mirror disk; force a re-unlock.
            vault.lock("sync-import").await;
        } else {
            vault.refresh_keystore_cache(merged).await;
        }
    }

    tracing::info!(
        keypairs_updated = outcome.keypairs_updated,
        previous_merged = outcome.previous_merged,
        rotations_merged = outcome.rotations_merged,
        "keystore import merged"
    );
    vault.events().emit(VaultEvent::ImportComplete {
        keypairs_updated: outcome.keypairs_updated,
    });

    Ok(ImportResult {
        keypairs_updated: outcome.keypairs_updated,
        previous_merged: outcome.previous_merged,
        rotations_merged: outcome.rotations_merged,
        conflicts_resolved: outcome.conflicts_resolved,
    })
}

/// Every real rotation this device has committed must be present in the
/// incoming history; an export made before one of them is a rollback
/// attempt. Bootstrap entries are device-local and exempt.
fn check_downgrade(
    local: &Keystore,
    imported_history: &[onestar_keystore::model::RotationHistoryEntry],
) -> Result<()> {
    let imported_ids: std::collections::HashSet<Uuid> =
        imported_history.iter().map(|e| e.rotation_id).collect();

    for entry in &local.rotation_history {
        if entry.old_key_id == entry.new_key_id {
            continue;
        }
        if !imported_ids.contains(&entry.rotation_id) {
            tracing::warn!(
                rotation_id = %entry.rotation_id,
                "local rotation missing from transfer"
            );
            return Err(VaultError::DowngradeDetected);
        }
    }
    Ok(())
}
