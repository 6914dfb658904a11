pub mod events;
pub mod fallback;
pub mod lifecycle;
pub mod lock;
pub mod media;
pub mod policy;
pub mod rotation;
pub mod scheduler;

pub use events::{EventBus, VaultEvent};
pub use fallback::{unwrap_media_key, unwrap_with_fallback};
pub use lifecycle::{ResidentKeys, Vault, VaultConfig, VaultState};
pub use lock::{RotationLockGuard, RotationLockRegistry};
pub use media::{MediaRecord, MediaRecords};
pub use rotation::{AbortSignal, RotationEngine, RotationOptions, RotationResult};
pub use scheduler::{RotationScheduler, SchedulerConfig};
