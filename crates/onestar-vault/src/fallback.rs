//! Fallback decryption across the current and retired keypairs.
//!
//! Every attempt runs to completion before a result is chosen, even when an
//! early attempt already succeeded — cancelling pending attempts would make
//! elapsed time depend on which generation wrapped the key, and that timing
//! difference is exactly the oracle this module exists to close. Elapsed
//! time is `max` over all attempts; the CPU multiplier is the number of
//! keypairs (typically 1–6).

use std::sync::Arc;

use futures::future::join_all;

use onestar_core::error::{Result, VaultError};
use onestar_core::hybrid::{self, HybridCiphertext, HybridKeypair, MediaKey};

use crate::lifecycle::Vault;

/// Try `ct` against the current keypair and every retired keypair
/// concurrently; select the first success in fixed order (current first,
/// then retired newest → oldest). Which attempt succeeded is logged only
/// after all attempts have resolved.
pub async fn unwrap_with_fallback(
    ct: &HybridCiphertext,
    current: Arc<HybridKeypair>,
    previous: &[Arc<HybridKeypair>],
) -> Result<MediaKey> {
    let attempts: Vec<Arc<HybridKeypair>> = std::iter::once(current)
        .chain(previous.iter().cloned())
        .collect();

    let handles: Vec<_> = attempts
        .iter()
        .map(|keypair| {
            let ct = ct.clone();
            let keypair = Arc::clone(keypair);
            tokio::task::spawn_blocking(move || hybrid::unwrap(&ct, &keypair).ok())
        })
        .collect();

    let outcomes = join_all(handles).await;

    let mut winner: Option<(usize, MediaKey)> = None;
    for (index, outcome) in outcomes.into_iter().enumerate() {
        let media_key = match outcome {
            Ok(Some(key)) => key,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(attempt = index, error = %e, "unwrap task panicked");
                continue;
            }
        };
        if winner.is_none() {
            winner = Some((index, media_key));
        }
    }

    match winner {
        Some((index, media_key)) => {
            tracing::debug!(
                key_id = %attempts[index].key_id,
                generation = index,
                "fallback unwrap succeeded"
            );
            Ok(media_key)
        }
        None => {
            tracing::debug!(attempts = attempts.len(), "all unwrap attempts failed");
            Err(VaultError::AllAttemptsFailed)
        }
    }
}

/// What the media index and streaming decoder call: borrow the vault's
/// resident keypairs and run the fallback attempt set. `VaultLocked` when
/// there is nothing resident.
pub async fn unwrap_media_key(vault: &Vault, ct: &HybridCiphertext) -> Result<MediaKey> {
    let resident = vault.resident_keys().await?;
    unwrap_with_fallback(ct, Arc::clone(&resident.current), &resident.previous).await
}
