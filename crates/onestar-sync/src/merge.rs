//! Deterministic merge of a local keystore with an imported payload.
//!
//! Device-local fields of the local keystore survive bit-for-bit; identity,
//! keypair and history state are unified. Applying the same payload to the
//! merged result again yields the same keystore.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use onestar_core::error::{Result, VaultError};
use onestar_keystore::model::{
    Keystore, MAX_PREVIOUS_KEYPAIRS, RetiredKeypair, RotationHistoryEntry,
};

use crate::format::SyncPayload;

/// Demotion reason stamped on a keypair superseded during merge.
const SUPERSEDED_REASON: &str = "superseded-by-sync";

pub struct MergeOutcome {
    pub keystore: Keystore,
    pub keypairs_updated: bool,
    pub previous_merged: u32,
    pub rotations_merged: u32,
    pub conflicts_resolved: u32,
}

/// A history entry whose `old_key_id == new_key_id` is a device bootstrap
/// record: it roots a chain rather than extending one.
fn is_bootstrap(entry: &RotationHistoryEntry) -> bool {
    entry.old_key_id == entry.new_key_id
}

/// A keystore that has never rotated nor synced: its only history is its
/// own bootstrap entry. Importing into a pristine keystore is second-device
/// onboarding, and the imported identity state wins outright.
pub fn is_pristine(keystore: &Keystore) -> bool {
    keystore.previous_keypairs.is_empty()
        && keystore.sync_history.is_empty()
        && keystore
            .rotation_history
            .iter()
            .all(|e| is_bootstrap(e) && e.new_key_id == keystore.current_keypair.key_id)
}

/// Latest moment the union history saw `key_id` become current. Bootstrap
/// entries rank below every real rotation.
fn last_promotion(
    history: &[RotationHistoryEntry],
    key_id: Uuid,
) -> (bool, Option<DateTime<Utc>>) {
    let rotated = history
        .iter()
        .filter(|e| !is_bootstrap(e) && e.new_key_id == key_id)
        .map(|e| e.timestamp)
        .max();
    if let Some(ts) = rotated {
        return (true, Some(ts));
    }
    let bootstrapped = history
        .iter()
        .filter(|e| is_bootstrap(e) && e.new_key_id == key_id)
        .map(|e| e.timestamp)
        .max();
    (false, bootstrapped)
}

pub fn merge(local: &Keystore, imported: &SyncPayload, now: DateTime<Utc>) -> Result<MergeOutcome> {
    // Union history first; conflict resolution ranks candidates against it.
    let mut history: Vec<RotationHistoryEntry> = Vec::new();
    let mut seen_rotations: HashSet<Uuid> = HashSet::new();
    let local_rotation_ids: HashSet<Uuid> =
        local.rotation_history.iter().map(|e| e.rotation_id).collect();
    let mut rotations_merged = 0u32;

    for entry in local
        .rotation_history
        .iter()
        .chain(imported.rotation_history.iter())
    {
        if seen_rotations.insert(entry.rotation_id) {
            if !local_rotation_ids.contains(&entry.rotation_id) {
                rotations_merged += 1;
            }
            history.push(entry.clone());
        }
    }
    history.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.rotation_id.cmp(&b.rotation_id))
    });

    verify_chain(&history)?;

    // Current keypair conflict.
    let mut keystore = local.clone();
    let mut conflicts_resolved = 0u32;
    let mut keypairs_updated = false;
    let mut demoted: Option<RetiredKeypair> = None;

    if local.current_keypair.public != imported.current_keypair.public {
        let import_wins = if is_pristine(local) {
            true
        } else {
            let local_rank = last_promotion(&history, local.current_keypair.key_id);
            let import_rank = last_promotion(&history, imported.current_keypair.key_id);
            match (local_rank, import_rank) {
                ((true, a), (true, b)) | ((false, a), (false, b)) => match b.cmp(&a) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => {
                        // Deterministic tie-break on the key id.
                        imported.current_keypair.key_id.to_string()
                            > local.current_keypair.key_id.to_string()
                    }
                },
                ((false, _), (true, _)) => true,
                ((true, _), (false, _)) => false,
            }
        };

        conflicts_resolved += 1;
        let (winner, loser) = if import_wins {
            (imported.current_keypair.clone(), local.current_keypair.clone())
        } else {
            (local.current_keypair.clone(), imported.current_keypair.clone())
        };
        tracing::info!(
            winner = %winner.key_id,
            demoted = %loser.key_id,
            "current keypair conflict resolved"
        );
        keystore.current_keypair = winner;
        // Either direction changes local key state: a new current, or a
        // newly retired foreign key.
        keypairs_updated = true;
        demoted = Some(RetiredKeypair {
            keypair: loser,
            retired_at: now,
            reason: SUPERSEDED_REASON.to_string(),
        });
    }

    // Previous keypairs union, deduplicated by public-key fingerprint.
    let local_fingerprints: HashSet<[u8; 32]> = local
        .previous_keypairs
        .iter()
        .map(|p| p.keypair.public.fingerprint())
        .collect();

    let mut previous: Vec<RetiredKeypair> = Vec::new();
    let mut seen_fingerprints: HashSet<[u8; 32]> = HashSet::new();
    // The new current key must never reappear in the retired list.
    seen_fingerprints.insert(keystore.current_keypair.public.fingerprint());

    let mut previous_merged = 0u32;
    let from_import = local.previous_keypairs.len();
    for (index, retired) in local
        .previous_keypairs
        .iter()
        .chain(imported.previous_keypairs.iter())
        .chain(demoted.iter())
        .enumerate()
    {
        let fingerprint = retired.keypair.public.fingerprint();
        if seen_fingerprints.insert(fingerprint) {
            let imported_entry = index >= from_import
                && index < from_import + imported.previous_keypairs.len();
            if imported_entry && !local_fingerprints.contains(&fingerprint) {
                previous_merged += 1;
                keypairs_updated = true;
            }
            previous.push(retired.clone());
        }
    }
    previous.sort_by(|a, b| b.retired_at.cmp(&a.retired_at));
    previous.truncate(MAX_PREVIOUS_KEYPAIRS);

    keystore.previous_keypairs = previous;
    keystore.rotation_history = history;
    // Device-local state (salt, iterations, biometric profile, settings,
    // device registry, sync history) stays exactly as `local` had it — it
    // was cloned wholesale above and never touched.

    Ok(MergeOutcome {
        keystore,
        keypairs_updated,
        previous_merged,
        rotations_merged,
        conflicts_resolved,
    })
}

/// Every non-bootstrap entry must retire a key some earlier entry (or a
/// bootstrap) introduced.
fn verify_chain(history: &[RotationHistoryEntry]) -> Result<()> {
    let mut resolved: HashSet<Uuid> = HashSet::new();
    for entry in history {
        if is_bootstrap(entry) {
            resolved.insert(entry.new_key_id);
            continue;
        }
        if !resolved.contains(&entry.old_key_id) {
            tracing::warn!(
                rotation_id = %entry.rotation_id,
                old_key = %entry.old_key_id,
                "rotation entry retires an unknown key"
            );
            return Err(VaultError::BrokenChain);
        }
        resolved.insert(entry.new_key_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use onestar_keystore::codec;
    use onestar_keystore::model::{MIN_PBKDF2_ITERATIONS, RotationTrigger};

    const PASSWORD: &str = "correct-horse-battery-staple-99";

    fn keystore_pair() -> (Keystore, Keystore) {
        let user_id = Uuid::now_v7();
        let (a, _) =
            codec::create_keystore(PASSWORD, Some(user_id), "device-a", MIN_PBKDF2_ITERATIONS)
                .unwrap();
        let (b, _) =
            codec::create_keystore(PASSWORD, Some(user_id), "device-b", MIN_PBKDF2_ITERATIONS)
                .unwrap();
        (a, b)
    }

    fn rotation_entry(
        old: Uuid,
        new: Uuid,
        device_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> RotationHistoryEntry {
        RotationHistoryEntry {
            rotation_id: Uuid::now_v7(),
            timestamp,
            old_key_id: old,
            new_key_id: new,
            reason: "scheduled".into(),
            media_rewrapped: 0,
            duration_ms: 10,
            triggered_by: RotationTrigger::Manual,
            device_id,
        }
    }

    #[test]
    fn identical_current_keys_do_not_conflict() {
        let (a, _) = keystore_pair();
        let payload = SyncPayload::from_keystore(&a);

        let outcome = merge(&a, &payload, Utc::now()).unwrap();
        assert_eq!(outcome.conflicts_resolved, 0);
        assert!(!outcome.keypairs_updated);
        assert_eq!(
            outcome.keystore.current_keypair.key_id,
            a.current_keypair.key_id
        );
    }

    #[test]
    fn pristine_local_adopts_imported_current() {
        let (a, b) = keystore_pair();
        let payload = SyncPayload::from_keystore(&a);

        let outcome = merge(&b, &payload, Utc::now()).unwrap();
        assert!(outcome.keypairs_updated);
        assert_eq!(outcome.conflicts_resolved, 1);
        assert_eq!(
            outcome.keystore.current_keypair.public,
            a.current_keypair.public
        );
        // B's bootstrap key is demoted, not lost.
        assert_eq!(outcome.keystore.previous_keypairs.len(), 1);
        assert_eq!(
            outcome.keystore.previous_keypairs[0].keypair.key_id,
            b.current_keypair.key_id
        );
        assert_eq!(
            outcome.keystore.previous_keypairs[0].reason,
            SUPERSEDED_REASON
        );
    }

    #[test]
    fn device_local_fields_survive_bit_for_bit() {
        let (a, mut b) = keystore_pair();
        b.biometric_profile = Some(serde_json::json!({"kind": "face"}));
        b.vault_settings.idle_timeout_ms = 42_000;
        let payload = SyncPayload::from_keystore(&a);

        let outcome = merge(&b, &payload, Utc::now()).unwrap();
        let merged = &outcome.keystore;
        assert_eq!(merged.password_salt, b.password_salt);
        assert_eq!(merged.pbkdf2_iterations, b.pbkdf2_iterations);
        assert_eq!(merged.device_id, b.device_id);
        assert_eq!(merged.device_name, b.device_name);
        assert_eq!(merged.device_created_at, b.device_created_at);
        assert_eq!(merged.biometric_profile, b.biometric_profile);
        assert_eq!(merged.vault_settings.idle_timeout_ms, 42_000);
        assert_eq!(merged.sync_history.len(), b.sync_history.len());
    }

    #[test]
    fn newer_rotation_wins_the_conflict() {
        let (mut a, mut b) = keystore_pair();

        // B rotated recently; its current key must win.
        let b_old = b.current_keypair.key_id;
        let b_new = Uuid::now_v7();
        let mut rotated = b.current_keypair.clone();
        rotated.key_id = b_new;
        let retired = RetiredKeypair {
            keypair: b.current_keypair.clone(),
            retired_at: Utc::now(),
            reason: "scheduled".into(),
        };
        b.current_keypair = rotated;
        b.previous_keypairs.push(retired);
        b.rotation_history
            .push(rotation_entry(b_old, b_new, b.device_id, Utc::now()));

        // Trim A to a plain never-rotated keystore that is not pristine.
        a.sync_history.push(onestar_keystore::model::SyncRecord {
            sync_id: Uuid::now_v7(),
            timestamp: Utc::now(),
            source_device_id: a.device_id,
            target_device_id: a.device_id,
            kind: onestar_keystore::model::SyncKind::Export,
            keypairs_updated: false,
            previous_merged: 0,
            rotations_merged: 0,
            conflicts_resolved: 0,
            signature_hash: vec![1, 2, 3],
        });

        let payload = SyncPayload::from_keystore(&b);
        let outcome = merge(&a, &payload, Utc::now()).unwrap();
        assert_eq!(outcome.keystore.current_keypair.key_id, b_new);
        assert!(outcome.keypairs_updated);
    }

    #[test]
    fn merge_is_idempotent_on_replay() {
        let (a, b) = keystore_pair();
        let payload = SyncPayload::from_keystore(&a);

        let first = merge(&b, &payload, Utc::now()).unwrap();
        let second = merge(&first.keystore, &payload, Utc::now()).unwrap();

        assert_eq!(second.conflicts_resolved, 0);
        assert_eq!(second.previous_merged, 0);
        assert_eq!(second.rotations_merged, 0);
        assert_eq!(
            codec::canonical_json(&first.keystore).unwrap(),
            codec::canonical_json(&second.keystore).unwrap()
        );
    }

    #[test]
    fn broken_chain_rejected() {
        let (a, b) = keystore_pair();
        let mut payload = SyncPayload::from_keystore(&a);

        // A rotation that retires a key no entry ever introduced.
        payload.rotation_history.push(rotation_entry(
            Uuid::now_v7(),
            Uuid::now_v7(),
            a.device_id,
            Utc::now(),
        ));

        assert!(matches!(
            merge(&b, &payload, Utc::now()),
            Err(VaultError::BrokenChain)
        ));
    }

    #[test]
    fn previous_union_deduplicates_and_caps() {
        let (a, mut b) = keystore_pair();

        // Ten retired keys on B already.
        for i in 0..10 {
            let mut kp = b.current_keypair.clone();
            kp.key_id = Uuid::now_v7();
            // Distinct publics via distinct ecdh bytes.
            kp.public.ecdh_public[0] = i as u8;
            kp.public.ecdh_public[1] = 0xA0;
            b.previous_keypairs.push(RetiredKeypair {
                keypair: kp,
                retired_at: Utc::now() - chrono::Duration::days(i64::from(i) + 1),
                reason: "scheduled".into(),
            });
        }

        let payload = SyncPayload::from_keystore(&a);
        let outcome = merge(&b, &payload, Utc::now()).unwrap();
        assert!(outcome.keystore.previous_keypairs.len() <= MAX_PREVIOUS_KEYPAIRS);
        // Newest retirements kept; the demoted bootstrap key (retired now)
        // heads the list.
        assert_eq!(
            outcome.keystore.previous_keypairs[0].reason,
            SUPERSEDED_REASON
        );
    }
}
