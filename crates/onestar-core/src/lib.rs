pub mod encoding;
pub mod error;
pub mod hybrid;
pub mod primitives;

pub use error::{Result, VaultError};
pub use hybrid::{
    HybridCiphertext, HybridKeypair, HybridPrivateKey, HybridPublicKey, MediaKey,
};
