//! Rotation scheduler: observes keystore age and emits `rotation_due`.
//! It never rotates on its own, and it defers to any in-flight manual
//! rotation instead of queueing behind it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::events::VaultEvent;
use crate::lifecycle::Vault;
use crate::lock::RotationLockRegistry;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub rotation_interval_days: i64,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rotation_interval_days: 180,
            poll_interval: Duration::from_secs(60 * 60),
        }
    }
}

pub struct RotationScheduler {
    vault: Arc<Vault>,
    locks: Arc<RotationLockRegistry>,
    config: SchedulerConfig,
}

impl RotationScheduler {
    pub fn new(
        vault: Arc<Vault>,
        locks: Arc<RotationLockRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            vault,
            locks,
            config,
        }
    }

    /// One age check. Emits `rotation_due` when the current keypair is old
    /// enough, `check_skipped` when a rotation holds the lock, and nothing
    /// while the vault is locked.
    pub async fn check(&self) {
        let Ok(keystore) = self.vault.keystore().await else {
            return;
        };

        if self.locks.is_locked(keystore.user_id) {
            self.vault.events().emit(VaultEvent::CheckSkipped {
                reason: "rotation-in-progress".to_string(),
            });
            return;
        }

        let age_days = keystore.current_keypair_age_days(Utc::now());
        if age_days >= self.config.rotation_interval_days {
            tracing::info!(age_days, "current keypair is due for rotation");
            self.vault
                .events()
                .emit(VaultEvent::RotationDue {
                    key_age_days: age_days,
                });
        }
    }

    /// Poll forever at the configured interval.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.check().await;
                tokio::time::sleep(self.config.poll_interval).await;
            }
        })
    }
}
