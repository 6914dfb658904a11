//! Seam to the media index. The core never assumes transactional semantics
//! across records; a failing list or update is just a failed record from
//! the rotation engine's point of view.

use async_trait::async_trait;
use uuid::Uuid;

use onestar_core::hybrid::HybridCiphertext;

/// One media record as the rotation engine sees it.
#[derive(Debug, Clone)]
pub struct MediaRecord {
    pub record_id: String,
    pub wrapped_key: HybridCiphertext,
}

/// Backend trait implemented by the media index.
#[async_trait]
pub trait MediaRecords: Send + Sync {
    /// Every record whose wrapped key depends on the user's keypairs, in
    /// whatever order the backend prefers.
    async fn list_records(&self, user_id: Uuid) -> anyhow::Result<Vec<MediaRecord>>;

    /// Replace one record's wrapped key.
    async fn update_wrapped_key(
        &self,
        record_id: &str,
        new_wrapped_key: HybridCiphertext,
    ) -> anyhow::Result<()>;
}
