//! In-process rotation lock registry, one slot per user.
//!
//! Locks do not persist across restarts and are cleared with the process.
//! A holder that died without releasing is evicted after `LOCK_TIMEOUT`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Stale locks auto-release after this long.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

struct LockEntry {
    acquired_at: Instant,
    operation: String,
}

#[derive(Default)]
pub struct RotationLockRegistry {
    inner: Mutex<HashMap<Uuid, LockEntry>>,
}

impl RotationLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, LockEntry>> {
        // A panicking holder must not wedge every future rotation.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to take the lock. Returns true on success; an existing lock past
    /// `LOCK_TIMEOUT` is treated as abandoned and taken over.
    pub fn acquire(&self, user_id: Uuid, operation: &str) -> bool {
        let mut map = self.map();
        if let Some(existing) = map.get(&user_id) {
            if existing.acquired_at.elapsed() < LOCK_TIMEOUT {
                return false;
            }
            tracing::warn!(
                %user_id,
                operation = %existing.operation,
                "evicting stale rotation lock"
            );
        }
        map.insert(
            user_id,
            LockEntry {
                acquired_at: Instant::now(),
                operation: operation.to_string(),
            },
        );
        true
    }

    /// Release a held lock. Safe to call when not held.
    pub fn release(&self, user_id: Uuid) {
        self.map().remove(&user_id);
    }

    /// Whether a live (non-stale) lock exists for the user.
    pub fn is_locked(&self, user_id: Uuid) -> bool {
        self.map()
            .get(&user_id)
            .is_some_and(|e| e.acquired_at.elapsed() < LOCK_TIMEOUT)
    }

    /// Unconditional release, for shutdown and crash-recovery paths only.
    pub fn force_release(&self, user_id: Uuid) {
        if self.map().remove(&user_id).is_some() {
            tracing::warn!(%user_id, "rotation lock force-released");
        }
    }
}

/// RAII guard: `release` runs on every exit path of the holder.
pub struct RotationLockGuard<'a> {
    registry: &'a RotationLockRegistry,
    user_id: Uuid,
}

impl<'a> RotationLockGuard<'a> {
    /// Acquire, or `None` when the lock is contended.
    pub fn try_acquire(
        registry: &'a RotationLockRegistry,
        user_id: Uuid,
        operation: &str,
    ) -> Option<Self> {
        registry
            .acquire(user_id, operation)
            .then_some(Self { registry, user_id })
    }
}

impl Drop for RotationLockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(self.user_id);
    }
}
