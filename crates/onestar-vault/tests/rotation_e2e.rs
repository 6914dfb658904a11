//! Rotation engine end-to-end, driven through a real on-disk keystore and
//! an in-memory media index.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use onestar_core::error::VaultError;
use onestar_core::hybrid::{self, HybridCiphertext, MediaKey};
use onestar_keystore::codec::canonical_json;
use onestar_vault::{
    AbortSignal, MediaRecord, MediaRecords, RotationEngine, RotationLockRegistry,
    RotationOptions, Vault, VaultConfig, VaultEvent, unwrap_with_fallback,
};

const PASSWORD: &str = "CorrectHorseBatteryStaple!99";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// In-memory media index with per-record update failure injection.
struct MemoryMediaIndex {
    records: Mutex<BTreeMap<String, HybridCiphertext>>,
    fail_updates_for: HashSet<String>,
}

impl MemoryMediaIndex {
    fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            fail_updates_for: HashSet::new(),
        }
    }

    async fn insert(&self, record_id: &str, wrapped: HybridCiphertext) {
        self.records
            .lock()
            .await
            .insert(record_id.to_string(), wrapped);
    }

    async fn wrapped_key(&self, record_id: &str) -> HybridCiphertext {
        self.records.lock().await.get(record_id).unwrap().clone()
    }
}

#[async_trait]
impl MediaRecords for MemoryMediaIndex {
    async fn list_records(&self, _user_id: Uuid) -> anyhow::Result<Vec<MediaRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .map(|(record_id, wrapped_key)| MediaRecord {
                record_id: record_id.clone(),
                wrapped_key: wrapped_key.clone(),
            })
            .collect())
    }

    async fn update_wrapped_key(
        &self,
        record_id: &str,
        new_wrapped_key: HybridCiphertext,
    ) -> anyhow::Result<()> {
        if self.fail_updates_for.contains(record_id) {
            anyhow::bail!("injected update failure for {record_id}");
        }
        self.records
            .lock()
            .await
            .insert(record_id.to_string(), new_wrapped_key);
        Ok(())
    }
}

struct Rig {
    vault: Arc<Vault>,
    locks: Arc<RotationLockRegistry>,
    media: Arc<MemoryMediaIndex>,
    engine: RotationEngine,
    _tmp: tempfile::TempDir,
}

async fn rig_with_media(media: MemoryMediaIndex) -> Rig {
    init_tracing();
    let tmp = tempfile::TempDir::new().unwrap();
    let vault = Vault::new(VaultConfig::new(tmp.path().join("keystore.json")));
    vault.unlock(PASSWORD).await.unwrap();

    let locks = Arc::new(RotationLockRegistry::new());
    let media = Arc::new(media);
    let engine = RotationEngine::new(
        Arc::clone(&vault),
        Arc::clone(&locks),
        Arc::clone(&media) as Arc<dyn MediaRecords>,
    );
    Rig {
        vault,
        locks,
        media,
        engine,
        _tmp: tmp,
    }
}

/// Seed `n` records wrapped under the vault's current public key. Returns
/// record ids and their media keys.
async fn seed_records(rig: &Rig, n: usize) -> Vec<(String, MediaKey)> {
    let public = rig.vault.get_current_public_key().await.unwrap();
    let mut seeded = Vec::with_capacity(n);
    for i in 0..n {
        let record_id = format!("media-{i:04}");
        let media_key = MediaKey::generate();
        let wrapped = hybrid::wrap(&media_key, &public).unwrap();
        rig.media.insert(&record_id, wrapped).await;
        seeded.push((record_id, media_key));
    }
    seeded
}

#[tokio::test]
async fn rotate_with_records_rewraps_everything() {
    let rig = rig_with_media(MemoryMediaIndex::new()).await;
    let seeded = seed_records(&rig, 3).await;
    let old_key_id = rig.vault.get_current_keypair().await.unwrap().key_id;

    let mut rx = rig.vault.events().subscribe();
    let result = rig
        .engine
        .rotate(PASSWORD, "scheduled", RotationOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.rollback_performed);
    assert_eq!(result.media_rewrapped, 3);
    assert_eq!(result.media_failed, 0);
    assert_eq!(result.old_key_id, old_key_id);

    let keystore = rig.vault.keystore().await.unwrap();
    assert_eq!(keystore.current_keypair.key_id, result.new_key_id.unwrap());
    assert_eq!(keystore.previous_keypairs.len(), 1);
    assert_eq!(keystore.previous_keypairs[0].keypair.key_id, old_key_id);
    assert_eq!(keystore.rotation_history.last().unwrap().reason, "scheduled");

    // Every record now unwraps under the new current keypair alone.
    let new_keypair = rig.vault.get_current_keypair().await.unwrap();
    for (record_id, media_key) in &seeded {
        let wrapped = rig.media.wrapped_key(record_id).await;
        let out = hybrid::unwrap(&wrapped, &new_keypair).unwrap();
        assert_eq!(out.as_bytes(), media_key.as_bytes());
    }

    // rotation_start then at least one progress then finished.
    let mut saw_start = false;
    let mut saw_progress = false;
    let mut saw_finished = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            VaultEvent::RotationStart { .. } => saw_start = true,
            VaultEvent::RotationProgress { .. } => saw_progress = true,
            VaultEvent::RotationFinished(r) => {
                saw_finished = true;
                assert!(r.success);
            }
            _ => {}
        }
    }
    assert!(saw_start && saw_progress && saw_finished);
}

#[tokio::test]
async fn failures_over_threshold_roll_back() {
    let mut media = MemoryMediaIndex::new();
    // 25 of 100 updates fail: over the default 0.20 threshold.
    for i in 0..25 {
        media.fail_updates_for.insert(format!("media-{:04}", i * 4));
    }
    let rig = rig_with_media(media).await;
    seed_records(&rig, 100).await;

    let before = canonical_json(&rig.vault.store().load().unwrap()).unwrap();
    let old_key_id = rig.vault.get_current_keypair().await.unwrap().key_id;

    let result = rig
        .engine
        .rotate(PASSWORD, "scheduled", RotationOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.rollback_performed);
    assert!(!result.aborted);
    assert_eq!(result.media_failed, 25);

    // Keystore is byte-identical to its pre-rotation form.
    let after = canonical_json(&rig.vault.store().load().unwrap()).unwrap();
    assert_eq!(before, after);
    assert_eq!(
        rig.vault.get_current_keypair().await.unwrap().key_id,
        old_key_id
    );
}

#[tokio::test]
async fn failures_under_threshold_commit() {
    let mut media = MemoryMediaIndex::new();
    for i in 0..10 {
        media.fail_updates_for.insert(format!("media-{:04}", i * 7));
    }
    let rig = rig_with_media(media).await;
    seed_records(&rig, 100).await;

    let result = rig
        .engine
        .rotate(PASSWORD, "scheduled", RotationOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.media_rewrapped, 90);
    assert_eq!(result.media_failed, 10);
}

#[tokio::test]
async fn zero_records_rotates_clean() {
    let rig = rig_with_media(MemoryMediaIndex::new()).await;

    let result = rig
        .engine
        .rotate(PASSWORD, "scheduled", RotationOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.media_rewrapped, 0);
    assert_eq!(result.media_failed, 0);
}

#[tokio::test]
async fn abort_before_first_record_rolls_back() {
    let rig = rig_with_media(MemoryMediaIndex::new()).await;
    seed_records(&rig, 5).await;

    let abort = AbortSignal::new();
    abort.abort();

    let result = rig
        .engine
        .rotate(
            PASSWORD,
            "scheduled",
            RotationOptions {
                abort: Some(abort),
                ..RotationOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(result.aborted);
    assert!(result.rollback_performed);
    assert_eq!(result.media_rewrapped, 0);
}

#[tokio::test]
async fn held_lock_rejects_rotation() {
    let rig = rig_with_media(MemoryMediaIndex::new()).await;
    let user_id = rig.vault.user_id().await.unwrap();
    assert!(rig.locks.acquire(user_id, "rotation"));

    match rig
        .engine
        .rotate(PASSWORD, "scheduled", RotationOptions::default())
        .await
    {
        Err(VaultError::LockHeld) => {}
        other => panic!("expected LockHeld, got {other:?}"),
    }

    // The failed attempt must not have stolen the lock.
    assert!(rig.locks.is_locked(user_id));
}

#[tokio::test]
async fn wrong_password_rejects_rotation() {
    let rig = rig_with_media(MemoryMediaIndex::new()).await;
    let user_id = rig.vault.user_id().await.unwrap();

    match rig
        .engine
        .rotate(
            "WrongHorseBatteryStaple!99",
            "scheduled",
            RotationOptions::default(),
        )
        .await
    {
        Err(VaultError::InvalidPassword) => {}
        other => panic!("expected InvalidPassword, got {other:?}"),
    }

    // Lock released on the failure path.
    assert!(!rig.locks.is_locked(user_id));
}

#[tokio::test]
async fn retired_list_caps_at_ten() {
    let rig = rig_with_media(MemoryMediaIndex::new()).await;
    let first_key_id = rig.vault.get_current_keypair().await.unwrap().key_id;

    let options = RotationOptions {
        re_wrap_media: false,
        ..RotationOptions::default()
    };
    for _ in 0..11 {
        let result = rig
            .engine
            .rotate(PASSWORD, "scheduled", options.clone())
            .await
            .unwrap();
        assert!(result.success);
    }

    let keystore = rig.vault.keystore().await.unwrap();
    assert_eq!(keystore.previous_keypairs.len(), 10);
    // The very first key fell off the end.
    assert!(
        keystore
            .previous_keypairs
            .iter()
            .all(|p| p.keypair.key_id != first_key_id)
    );
    keystore.validate().unwrap();
}

#[tokio::test]
async fn old_wraps_still_open_through_fallback_after_rotation() {
    let rig = rig_with_media(MemoryMediaIndex::new()).await;
    let media_key = MediaKey::generate();
    let old_public = rig.vault.get_current_public_key().await.unwrap();
    let wrapped_old = hybrid::wrap(&media_key, &old_public).unwrap();

    let result = rig
        .engine
        .rotate(
            PASSWORD,
            "scheduled",
            RotationOptions {
                re_wrap_media: false,
                ..RotationOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(result.success);

    let resident = rig.vault.resident_keys().await.unwrap();
    let out = unwrap_with_fallback(&wrapped_old, Arc::clone(&resident.current), &resident.previous)
        .await
        .unwrap();
    assert_eq!(out.as_bytes(), media_key.as_bytes());

    // Fresh wraps under the new key also open.
    let wrapped_new = hybrid::wrap(&media_key, &resident.current.public).unwrap();
    let out = unwrap_with_fallback(&wrapped_new, Arc::clone(&resident.current), &resident.previous)
        .await
        .unwrap();
    assert_eq!(out.as_bytes(), media_key.as_bytes());

    // The vault-borrowing entry point resolves the same way, and refuses
    // to run once locked.
    let out = onestar_vault::unwrap_media_key(&rig.vault, &wrapped_old)
        .await
        .unwrap();
    assert_eq!(out.as_bytes(), media_key.as_bytes());

    rig.vault.lock("test").await;
    assert!(matches!(
        onestar_vault::unwrap_media_key(&rig.vault, &wrapped_old).await,
        Err(VaultError::VaultLocked)
    ));
}

#[tokio::test]
async fn rotation_survives_relock_and_reopen() {
    let rig = rig_with_media(MemoryMediaIndex::new()).await;
    let result = rig
        .engine
        .rotate(
            PASSWORD,
            "security-audit",
            RotationOptions {
                re_wrap_media: false,
                ..RotationOptions::default()
            },
        )
        .await
        .unwrap();

    rig.vault.lock("test").await;
    rig.vault.unlock(PASSWORD).await.unwrap();

    let keystore = rig.vault.keystore().await.unwrap();
    assert_eq!(
        keystore.current_keypair.key_id,
        result.new_key_id.unwrap()
    );
    assert_eq!(keystore.previous_keypairs.len(), 1);

    // The reopened vault can still decrypt wraps made before the rotation.
    let resident = rig.vault.resident_keys().await.unwrap();
    assert_eq!(resident.previous.len(), 1);
    assert_eq!(resident.previous[0].key_id, result.old_key_id);
}
