use thiserror::Error;

/// Flat error taxonomy shared by every crate in the workspace.
///
/// `InvalidPassword`, `UnwrapFailure` and `Tampered` deliberately render as
/// the same opaque message: callers must not be able to tell a wrong password
/// from a flipped ciphertext byte, or a KEM failure from a GCM tag mismatch.
/// The specific cause is recorded on the internal log at the failure site.
#[derive(Debug, Error)]
pub enum VaultError {
    // Lifecycle
    #[error("vault is locked")]
    VaultLocked,

    #[error("an unlock is already in progress")]
    AlreadyUnlocking,

    #[error("operation failed")]
    InvalidPassword,

    #[error("password rejected: {0}")]
    WeakPassword(String),

    // Rotation
    #[error("a rotation is already in progress for this user")]
    LockHeld,

    #[error("rotation aborted")]
    Aborted,

    // Unwrap
    #[error("operation failed")]
    UnwrapFailure,

    #[error("no keypair could unwrap the media key")]
    AllAttemptsFailed,

    // Sync
    #[error("operation failed")]
    Tampered,

    #[error("transfer file is corrupted")]
    Corrupted,

    #[error("transfer file was already imported")]
    Replay,

    #[error("transfer file would roll back local rotation state")]
    DowngradeDetected,

    #[error("transfer file belongs to a different identity")]
    IdentityMismatch,

    #[error("rotation history chain is broken")]
    BrokenChain,

    // Keystore
    #[error("keystore version {0} is newer than this build supports")]
    UnsupportedVersion(String),

    #[error("corrupt keystore: {0}")]
    CorruptKeystore(String),

    // IO
    #[error("IO error: {0}")]
    IoFailure(#[from] std::io::Error),

    // Crypto provider
    #[error("crypto primitive failure: {0}")]
    PrimitiveFailure(String),
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::CorruptKeystore(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
