//! Event bus the host shell observes. The core never links a UI; everything
//! a desktop frontend needs to show (lock state, rotation progress, sync
//! outcomes) flows through here.

use std::fmt;

use tokio::sync::broadcast;

use crate::lifecycle::VaultState;
use crate::rotation::RotationResult;

#[derive(Debug, Clone)]
pub enum VaultEvent {
    StateChange {
        old_state: VaultState,
        new_state: VaultState,
        reason: String,
    },
    IdleTimeout,
    RotationStart {
        reason: String,
    },
    RotationProgress {
        current: u32,
        total: u32,
        success: u32,
        failed: u32,
    },
    RotationFinished(RotationResult),
    RotationError {
        message: String,
    },
    RotationRollback,
    RotationDue {
        key_age_days: i64,
    },
    CheckSkipped {
        reason: String,
    },
    ExportComplete {
        path: std::path::PathBuf,
    },
    ImportComplete {
        keypairs_updated: bool,
    },
}

impl VaultEvent {
    /// Stable dotted name, the key hosts route on.
    pub fn name(&self) -> &'static str {
        match self {
            VaultEvent::StateChange { .. } => "vault.state_change",
            VaultEvent::IdleTimeout => "vault.idle_timeout",
            VaultEvent::RotationStart { .. } => "rotation.start",
            VaultEvent::RotationProgress { .. } => "rotation.progress",
            VaultEvent::RotationFinished(_) => "rotation.finished",
            VaultEvent::RotationError { .. } => "rotation.error",
            VaultEvent::RotationRollback => "rotation.rollback",
            VaultEvent::RotationDue { .. } => "scheduler.rotation_due",
            VaultEvent::CheckSkipped { .. } => "scheduler.check_skipped",
            VaultEvent::ExportComplete { .. } => "sync.export_complete",
            VaultEvent::ImportComplete { .. } => "sync.import_complete",
        }
    }
}

impl fmt::Display for VaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Broadcast fan-out. Emission never blocks and never fails: with no
/// subscribers the event is dropped, which is the correct behavior for a
/// headless embedding.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VaultEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: VaultEvent) {
        tracing::debug!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
