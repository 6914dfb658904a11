pub mod codec;
pub mod migrate;
pub mod model;
pub mod store;

pub use model::{
    Keystore, RetiredKeypair, RotationHistoryEntry, RotationTrigger, StoredKeypair, SyncKind,
    SyncRecord, VaultSettings,
};
pub use store::KeystoreStore;
