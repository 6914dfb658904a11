//! Keypair rotation: generate, re-wrap, commit — or roll back.
//!
//! The protocol is a straight line of commit/failure points: lock, password
//! re-verify, in-memory snapshot, new keypair, re-wrap loop, threshold
//! check, atomic commit. Rollback restores the snapshot exactly; media
//! records the collaborator already updated are left as they are, which is
//! the documented single-phase trade-off.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;
use zeroize::Zeroizing;

use onestar_core::error::{Result, VaultError};
use onestar_core::hybrid::{self, HybridKeypair, HybridPublicKey};
use onestar_keystore::codec::{self, KdfCache};
use onestar_keystore::model::{
    Keystore, MAX_PREVIOUS_KEYPAIRS, RetiredKeypair, RotationHistoryEntry, RotationTrigger,
};

use crate::events::VaultEvent;
use crate::lifecycle::{Vault, VaultState};
use crate::lock::{RotationLockGuard, RotationLockRegistry};
use crate::media::{MediaRecord, MediaRecords};

/// Progress events fire every this many records.
const PROGRESS_STRIDE: u32 = 10;

/// Cooperative cancellation token, polled at re-wrap iteration boundaries.
/// Abort after commit is a no-op.
#[derive(Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct RotationOptions {
    pub re_wrap_media: bool,
    /// Roll back when `failed / total` exceeds this fraction.
    pub rollback_on_failure_threshold: f64,
    pub abort: Option<AbortSignal>,
    pub triggered_by: RotationTrigger,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            re_wrap_media: true,
            rollback_on_failure_threshold: 0.20,
            abort: None,
            triggered_by: RotationTrigger::Manual,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RotationResult {
    pub success: bool,
    pub new_key_id: Option<Uuid>,
    pub old_key_id: Uuid,
    pub media_rewrapped: u32,
    pub media_failed: u32,
    pub duration_ms: u32,
    pub aborted: bool,
    pub rollback_performed: bool,
    pub error: Option<String>,
}

pub struct RotationEngine {
    vault: Arc<Vault>,
    locks: Arc<RotationLockRegistry>,
    media: Arc<dyn MediaRecords>,
}

impl RotationEngine {
    pub fn new(
        vault: Arc<Vault>,
        locks: Arc<RotationLockRegistry>,
        media: Arc<dyn MediaRecords>,
    ) -> Self {
        Self { vault, locks, media }
    }

    /// Rotate the current keypair. Precondition failures (`LockHeld`,
    /// `VaultLocked`, `InvalidPassword`) are errors; a rotation that ran and
    /// rolled back is an `Ok` result with `rollback_performed: true`.
    pub async fn rotate(
        &self,
        password: &str,
        reason: &str,
        options: RotationOptions,
    ) -> Result<RotationResult> {
        let started = Instant::now();

        let keystore = self.vault.store().load()?;
        let user_id = keystore.user_id;

        let Some(_lock) = RotationLockGuard::try_acquire(&self.locks, user_id, "rotation") else {
            tracing::warn!(%user_id, "rotation lock contended");
            return Err(VaultError::LockHeld);
        };

        // Re-verify the password even though the vault is unlocked: an
        // unlocked session left on a desk must not be enough to rotate.
        if self.vault.state().await != VaultState::Unlocked {
            return Err(VaultError::VaultLocked);
        }
        let pw = Zeroizing::new(password.to_owned());
        let verify_ks = keystore.clone();
        let device_salt = keystore.password_salt;
        let iterations = keystore.pbkdf2_iterations;
        let commit_key: Zeroizing<[u8; 32]> = run_blocking(move || {
            let mut cache = KdfCache::new();
            codec::decrypt_keypair_with_password(&verify_ks.current_keypair, &pw, &mut cache)?;
            Ok(cache.derive(&pw, &device_salt, iterations))
        })
        .await?;

        let old_keypair = self.vault.get_current_keypair().await?;
        let old_key_id = old_keypair.key_id;
        if old_key_id != keystore.current_keypair.key_id {
            return Err(VaultError::CorruptKeystore(
                "resident keypair does not match stored keypair".into(),
            ));
        }

        self.vault.events().emit(VaultEvent::RotationStart {
            reason: reason.to_string(),
        });
        tracing::info!(%user_id, old_key = %old_key_id, %reason, "rotation started");

        // Snapshot for rollback, taken before anything mutates.
        let snapshot = keystore.clone();

        let new_keypair = hybrid::generate_keypair()?;

        let mut rewrapped = 0u32;
        let mut failed = 0u32;
        let mut total = 0u32;
        let mut aborted = false;

        if options.re_wrap_media {
            let records = match self.media.list_records(user_id).await {
                Ok(records) => records,
                Err(e) => {
                    let message = format!("media record listing failed: {e}");
                    return self
                        .rollback(
                            snapshot, new_keypair, old_key_id, 0, 0, false, message, started,
                        )
                        .await;
                }
            };
            total = records.len() as u32;

            for (index, record) in records.iter().enumerate() {
                if options.abort.as_ref().is_some_and(AbortSignal::is_aborted) {
                    aborted = true;
                    break;
                }

                match self
                    .re_wrap_one(record, &old_keypair, &new_keypair.public)
                    .await
                {
                    Ok(()) => rewrapped += 1,
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(record_id = %record.record_id, error = %e, "re-wrap failed");
                    }
                }

                let done = (index + 1) as u32;
                if done % PROGRESS_STRIDE == 0 || done == total {
                    self.vault.events().emit(VaultEvent::RotationProgress {
                        current: done,
                        total,
                        success: rewrapped,
                        failed,
                    });
                }
            }
        }

        let over_threshold =
            total > 0 && f64::from(failed) / f64::from(total) > options.rollback_on_failure_threshold;
        if aborted || over_threshold {
            let message = if aborted {
                "rotation aborted by caller".to_string()
            } else {
                format!("{failed}/{total} re-wraps failed, over threshold")
            };
            return self
                .rollback(
                    snapshot,
                    new_keypair,
                    old_key_id,
                    rewrapped,
                    failed,
                    aborted,
                    message,
                    started,
                )
                .await;
        }

        // Commit: demote the old keypair, seat the new one, append history.
        let now = Utc::now();
        let mut committed = keystore;
        committed.previous_keypairs.insert(
            0,
            RetiredKeypair {
                keypair: committed.current_keypair.clone(),
                retired_at: now,
                reason: reason.to_string(),
            },
        );
        committed.previous_keypairs.truncate(MAX_PREVIOUS_KEYPAIRS);
        committed.current_keypair =
            codec::encrypt_keypair(&new_keypair, &commit_key, &device_salt, iterations)?;
        committed.rotation_history.push(RotationHistoryEntry {
            rotation_id: Uuid::now_v7(),
            timestamp: now,
            old_key_id,
            new_key_id: new_keypair.key_id,
            reason: reason.to_string(),
            media_rewrapped: rewrapped,
            duration_ms: started.elapsed().as_millis() as u32,
            triggered_by: options.triggered_by,
            device_id: committed.device_id,
        });
        committed.last_modified = now;

        if let Err(e) = self.vault.store().atomic_save(&committed) {
            // Rename atomicity means disk still holds the pre-rotation
            // state; surface it as a rollback.
            let message = format!("commit failed: {e}");
            return self
                .rollback(
                    snapshot,
                    new_keypair,
                    old_key_id,
                    rewrapped,
                    failed,
                    false,
                    message,
                    started,
                )
                .await;
        }

        let new_key_id = new_keypair.key_id;
        self.vault
            .install_rotation(committed, Arc::new(new_keypair))
            .await;
        drop(old_keypair);

        let result = RotationResult {
            success: true,
            new_key_id: Some(new_key_id),
            old_key_id,
            media_rewrapped: rewrapped,
            media_failed: failed,
            duration_ms: started.elapsed().as_millis() as u32,
            aborted: false,
            rollback_performed: false,
            error: None,
        };
        tracing::info!(
            new_key = %new_key_id,
            media_rewrapped = rewrapped,
            media_failed = failed,
            "rotation committed"
        );
        self.vault
            .events()
            .emit(VaultEvent::RotationFinished(result.clone()));
        Ok(result)
    }

    async fn re_wrap_one(
        &self,
        record: &MediaRecord,
        old_keypair: &Arc<HybridKeypair>,
        new_public: &HybridPublicKey,
    ) -> Result<()> {
        let ct = record.wrapped_key.clone();
        let old_keypair = Arc::clone(old_keypair);
        let new_public = new_public.clone();
        let new_ct = run_blocking(move || {
            let media_key = hybrid::unwrap(&ct, &old_keypair)?;
            hybrid::wrap(&media_key, &new_public)
        })
        .await?;

        self.media
            .update_wrapped_key(&record.record_id, new_ct)
            .await
            .map_err(|e| VaultError::IoFailure(std::io::Error::other(e.to_string())))
    }

    #[allow(clippy::too_many_arguments)]
    async fn rollback(
        &self,
        snapshot: Keystore,
        new_keypair: HybridKeypair,
        old_key_id: Uuid,
        rewrapped: u32,
        failed: u32,
        aborted: bool,
        message: String,
        started: Instant,
    ) -> Result<RotationResult> {
        // The uncommitted private key must not outlive the rotation.
        drop(new_keypair);

        if let Err(e) = self.vault.store().atomic_save(&snapshot) {
            tracing::error!(error = %e, "rollback persistence failed; on-disk state unchanged");
        }
        self.vault.refresh_keystore_cache(snapshot).await;

        tracing::warn!(%old_key_id, aborted, %message, "rotation rolled back");
        self.vault.events().emit(VaultEvent::RotationRollback);
        self.vault.events().emit(VaultEvent::RotationError {
            message: message.clone(),
        });

        let result = RotationResult {
            success: false,
            new_key_id: None,
            old_key_id,
            media_rewrapped: rewrapped,
            media_failed: failed,
            duration_ms: started.elapsed().as_millis() as u32,
            aborted,
            rollback_performed: true,
            error: Some(message),
        };
        self.vault
            .events()
            .emit(VaultEvent::RotationFinished(result.clone()));
        Ok(result)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::PrimitiveFailure(format!("blocking task failed: {e}")))?
}
