//! Vault lifecycle: the LOCKED → UNLOCKING → UNLOCKED state machine and the
//! resident decrypted keypairs.
//!
//! The resident keys are owned exclusively here and handed out as `Arc`
//! snapshots; lock/unlock replaces the reference atomically instead of
//! mutating in place, so read-only consumers (wrap, fallback unwrap) run
//! concurrently against a stable snapshot.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

use onestar_core::error::{Result, VaultError};
use onestar_core::hybrid::{HybridKeypair, HybridPublicKey};
use onestar_keystore::codec::{self, KdfCache};
use onestar_keystore::model::{
    Keystore, MAX_PREVIOUS_KEYPAIRS, MIN_PBKDF2_ITERATIONS, VaultSettings,
};
use onestar_keystore::store::KeystoreStore;

use crate::events::{EventBus, VaultEvent};
use crate::policy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    Locked,
    Unlocking,
    Unlocked,
}

impl fmt::Display for VaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultState::Locked => write!(f, "locked"),
            VaultState::Unlocking => write!(f, "unlocking"),
            VaultState::Unlocked => write!(f, "unlocked"),
        }
    }
}

/// Immutable snapshot of the decrypted keypairs, swapped wholesale on
/// lock/unlock/rotation.
pub struct ResidentKeys {
    pub current: Arc<HybridKeypair>,
    /// Newest → oldest, mirroring `previous_keypairs` on disk.
    pub previous: Vec<Arc<HybridKeypair>>,
}

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub keystore_path: PathBuf,
    pub device_name: String,
    /// Identity to provision on first unlock; a fresh one is minted when
    /// absent. Ignored once a keystore exists.
    pub user_id: Option<Uuid>,
    pub pbkdf2_iterations: u32,
}

impl VaultConfig {
    pub fn new(keystore_path: impl Into<PathBuf>) -> Self {
        Self {
            keystore_path: keystore_path.into(),
            device_name: "primary".to_string(),
            user_id: None,
            pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
        }
    }
}

pub struct Vault {
    store: KeystoreStore,
    device_name: String,
    provision_user_id: Option<Uuid>,
    pbkdf2_iterations: u32,
    state: RwLock<VaultState>,
    resident: RwLock<Option<Arc<ResidentKeys>>>,
    /// At-rest snapshot of the keystore while unlocked. Contains no
    /// plaintext key material.
    cached: RwLock<Option<Keystore>>,
    events: EventBus,
    last_activity: std::sync::Mutex<Instant>,
    last_unlocked_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    /// Bumped on every lock/unlock so a superseded idle watcher retires.
    idle_generation: AtomicU64,
}

impl Vault {
    pub fn new(config: VaultConfig) -> Arc<Self> {
        Arc::new(Self {
            store: KeystoreStore::new(config.keystore_path),
            device_name: config.device_name,
            provision_user_id: config.user_id,
            pbkdf2_iterations: config.pbkdf2_iterations.max(MIN_PBKDF2_ITERATIONS),
            state: RwLock::new(VaultState::Locked),
            resident: RwLock::new(None),
            cached: RwLock::new(None),
            events: EventBus::default(),
            last_activity: std::sync::Mutex::new(Instant::now()),
            last_unlocked_at: std::sync::Mutex::new(None),
            idle_generation: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &KeystoreStore {
        &self.store
    }

    pub async fn state(&self) -> VaultState {
        *self.state.read().await
    }

    pub fn last_unlocked_at(&self) -> Option<DateTime<Utc>> {
        *lock_recover(&self.last_unlocked_at)
    }

    /// Unlock with the vault password, creating the keystore on first use.
    /// Policy runs before any KDF work; concurrent callers see
    /// `AlreadyUnlocking`.
    pub async fn unlock(self: &Arc<Self>, password: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                VaultState::Unlocking => return Err(VaultError::AlreadyUnlocking),
                VaultState::Unlocked => return Ok(()),
                VaultState::Locked => *state = VaultState::Unlocking,
            }
        }
        self.emit_state(VaultState::Locked, VaultState::Unlocking, "unlock");

        match self.unlock_inner(password).await {
            Ok(()) => {
                *self.state.write().await = VaultState::Unlocked;
                *lock_recover(&self.last_unlocked_at) = Some(Utc::now());
                self.record_activity();
                self.emit_state(VaultState::Unlocking, VaultState::Unlocked, "unlock");
                self.spawn_idle_watch();
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = VaultState::Locked;
                self.emit_state(VaultState::Unlocking, VaultState::Locked, "unlock-failed");
                Err(e)
            }
        }
    }

    async fn unlock_inner(self: &Arc<Self>, password: &str) -> Result<()> {
        if !self.store.exists() {
            policy::check_password(password, VaultSettings::default().min_password_length)?;

            let pw = Zeroizing::new(password.to_owned());
            let user_id = self.provision_user_id;
            let device_name = self.device_name.clone();
            let iterations = self.pbkdf2_iterations;
            let (keystore, keypair) = run_blocking(move || {
                codec::create_keystore(&pw, user_id, &device_name, iterations)
            })
            .await?;

            self.store.atomic_save(&keystore)?;
            tracing::info!(user_id = %keystore.user_id, "keystore created");

            self.install(keystore, Arc::new(keypair), Vec::new()).await;
            return Ok(());
        }

        let keystore = self.store.load()?;
        policy::check_password(password, keystore.vault_settings.min_password_length)?;

        let pw = Zeroizing::new(password.to_owned());
        let ks = keystore.clone();
        let (current, previous) = run_blocking(move || codec::decrypt_all(&ks, &pw)).await?;

        self.install(
            keystore,
            Arc::new(current),
            previous.into_iter().map(Arc::new).collect(),
        )
        .await;
        Ok(())
    }

    async fn install(
        &self,
        keystore: Keystore,
        current: Arc<HybridKeypair>,
        previous: Vec<Arc<HybridKeypair>>,
    ) {
        *self.resident.write().await = Some(Arc::new(ResidentKeys { current, previous }));
        *self.cached.write().await = Some(keystore);
    }

    /// Drop resident material and transition to LOCKED. Idempotent.
    pub async fn lock(&self, reason: &str) {
        self.idle_generation.fetch_add(1, Ordering::SeqCst);

        let old = {
            let mut state = self.state.write().await;
            let old = *state;
            *state = VaultState::Locked;
            old
        };
        *self.resident.write().await = None;
        *self.cached.write().await = None;

        if old != VaultState::Locked {
            tracing::info!(%reason, "vault locked");
            self.emit_state(old, VaultState::Locked, reason);
        }
    }

    /// Push the idle deadline out. Call on any user interaction.
    pub fn record_activity(&self) {
        *lock_recover(&self.last_activity) = Instant::now();
    }

    /// The resident current keypair. `VaultLocked` unless UNLOCKED.
    pub async fn get_current_keypair(&self) -> Result<Arc<HybridKeypair>> {
        Ok(Arc::clone(&self.resident_keys().await?.current))
    }

    /// The current public key, for wrapping fresh media keys.
    pub async fn get_current_public_key(&self) -> Result<HybridPublicKey> {
        Ok(self.resident_keys().await?.current.public.clone())
    }

    /// Snapshot of every resident keypair, for fallback decryption and
    /// rotation. `VaultLocked` unless UNLOCKED.
    pub async fn resident_keys(&self) -> Result<Arc<ResidentKeys>> {
        if *self.state.read().await != VaultState::Unlocked {
            return Err(VaultError::VaultLocked);
        }
        self.resident
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(VaultError::VaultLocked)
    }

    /// At-rest snapshot of the keystore. `VaultLocked` unless UNLOCKED.
    pub async fn keystore(&self) -> Result<Keystore> {
        if *self.state.read().await != VaultState::Unlocked {
            return Err(VaultError::VaultLocked);
        }
        self.cached
            .read()
            .await
            .clone()
            .ok_or(VaultError::VaultLocked)
    }

    pub async fn user_id(&self) -> Result<Uuid> {
        Ok(self.keystore().await?.user_id)
    }

    /// Replace the cached at-rest snapshot after an external mutation
    /// (sync import persists through the store, then calls this).
    pub async fn refresh_keystore_cache(&self, keystore: Keystore) {
        *self.cached.write().await = Some(keystore);
    }

    /// Swap in a freshly committed rotation: the new keypair becomes
    /// current, the old one heads the retired list.
    pub(crate) async fn install_rotation(
        &self,
        keystore: Keystore,
        new_keypair: Arc<HybridKeypair>,
    ) {
        let mut previous = Vec::new();
        if let Some(resident) = self.resident.read().await.as_ref() {
            previous.push(Arc::clone(&resident.current));
            previous.extend(resident.previous.iter().cloned());
            previous.truncate(MAX_PREVIOUS_KEYPAIRS);
        }
        *self.resident.write().await = Some(Arc::new(ResidentKeys {
            current: new_keypair,
            previous,
        }));
        *self.cached.write().await = Some(keystore);
    }

    /// Re-encrypt every keypair under a new password with a fresh salt.
    /// The new password passes the same policy gate as unlock.
    pub async fn change_password(&self, current_password: &str, new_password: &str) -> Result<()> {
        let keystore = self.keystore().await?;
        policy::check_password(new_password, keystore.vault_settings.min_password_length)?;

        let current_pw = Zeroizing::new(current_password.to_owned());
        let new_pw = Zeroizing::new(new_password.to_owned());
        let rebuilt = run_blocking(move || reseal_keystore(keystore, &current_pw, &new_pw)).await?;

        self.store.atomic_save(&rebuilt)?;
        *self.cached.write().await = Some(rebuilt);
        tracing::info!("vault password changed");
        Ok(())
    }

    /// Explicit destruction: resident material zeroized, file and backups
    /// removed. The vault ends LOCKED with reason `"erased"`.
    pub async fn erase(&self) -> Result<()> {
        if *self.state.read().await != VaultState::Unlocked {
            return Err(VaultError::VaultLocked);
        }
        self.lock("erased").await;
        self.store.erase()
    }

    /// Persist new lock-trigger/idle knobs. The minimum password length
    /// cannot drop below the policy floor.
    pub async fn update_settings(&self, mut settings: VaultSettings) -> Result<()> {
        let floor = VaultSettings::default().min_password_length;
        if settings.min_password_length < floor {
            tracing::warn!(
                requested = settings.min_password_length,
                floor,
                "minimum password length clamped"
            );
            settings.min_password_length = floor;
        }

        let mut keystore = self.keystore().await?;
        keystore.vault_settings = settings;
        keystore.last_modified = Utc::now();
        self.store.atomic_save(&keystore)?;
        *self.cached.write().await = Some(keystore);
        Ok(())
    }

    /// Attach an opaque biometric profile. Device-local; never exported.
    pub async fn set_biometric_profile(&self, profile: serde_json::Value) -> Result<()> {
        self.mutate_biometric(Some(profile)).await
    }

    pub async fn clear_biometric_profile(&self) -> Result<()> {
        self.mutate_biometric(None).await
    }

    async fn mutate_biometric(&self, profile: Option<serde_json::Value>) -> Result<()> {
        let mut keystore = self.keystore().await?;
        keystore.biometric_profile = profile;
        keystore.last_modified = Utc::now();
        self.store.atomic_save(&keystore)?;
        *self.cached.write().await = Some(keystore);
        Ok(())
    }

    fn emit_state(&self, old_state: VaultState, new_state: VaultState, reason: &str) {
        self.events.emit(VaultEvent::StateChange {
            old_state,
            new_state,
            reason: reason.to_string(),
        });
    }

    fn spawn_idle_watch(self: &Arc<Self>) {
        let generation = self.idle_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let Some(vault) = weak.upgrade() else { return };
                if vault.idle_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if *vault.state.read().await != VaultState::Unlocked {
                    return;
                }

                let timeout_ms = vault
                    .cached
                    .read()
                    .await
                    .as_ref()
                    .map(|k| k.vault_settings.idle_timeout_ms)
                    .unwrap_or(0);
                if timeout_ms == 0 {
                    return;
                }

                let elapsed = lock_recover(&vault.last_activity).elapsed();
                let timeout = Duration::from_millis(timeout_ms);
                if elapsed >= timeout {
                    vault.events.emit(VaultEvent::IdleTimeout);
                    vault.lock("idle").await;
                    return;
                }

                let sleep_for = timeout - elapsed;
                drop(vault);
                tokio::time::sleep(sleep_for).await;
            }
        });
    }
}

/// Decrypt everything with the old password, reseal with the new one under
/// a fresh salt. A retired record that no longer opens is dropped rather
/// than carried forward sealed under a password the user just retired.
fn reseal_keystore(
    mut keystore: Keystore,
    current_password: &str,
    new_password: &str,
) -> Result<Keystore> {
    let mut cache = KdfCache::new();
    let current =
        codec::decrypt_keypair_with_password(&keystore.current_keypair, current_password, &mut cache)?;

    let new_salt = onestar_core::primitives::random_array::<32>();
    let iterations = keystore.pbkdf2_iterations;
    let new_key =
        onestar_core::primitives::pbkdf2_sha512(new_password.as_bytes(), &new_salt, iterations);

    let mut previous = Vec::with_capacity(keystore.previous_keypairs.len());
    for retired in &keystore.previous_keypairs {
        match codec::decrypt_keypair_with_password(&retired.keypair, current_password, &mut cache) {
            Ok(kp) => {
                let resealed = codec::encrypt_keypair(&kp, &new_key, &new_salt, iterations)?;
                previous.push(onestar_keystore::model::RetiredKeypair {
                    keypair: resealed,
                    retired_at: retired.retired_at,
                    reason: retired.reason.clone(),
                });
            }
            Err(_) => {
                tracing::warn!(
                    key_id = %retired.keypair.key_id,
                    "retired keypair unopenable; dropped during password change"
                );
            }
        }
    }

    keystore.password_salt = new_salt;
    keystore.current_keypair = codec::encrypt_keypair(&current, &new_key, &new_salt, iterations)?;
    keystore.previous_keypairs = previous;
    keystore.last_modified = Utc::now();
    Ok(keystore)
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

fn lock_recover<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
