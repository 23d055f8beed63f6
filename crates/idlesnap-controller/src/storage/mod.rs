//! Checkpoint blob storage
//!
//! Blobs land in one of two tiers:
//! - a bounded, shared memory pool (fast restore path)
//! - a zstd-compressed directory on local disk (cold tier)
//!
//! Every blob is identified by `(instance, generation)` and verified against
//! its SHA-256 before it is handed back to a restore.

mod cold;
mod pool;
mod tier;

pub use cold::ColdStore;
pub use pool::{EvictionPolicy, MemoryPoolStore, PoolKey, PoolStats};
pub use tier::TierPolicy;

use idlesnap_common::{BlobRef, Result, SnapshotError, StorageTier};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Lowercase hex SHA-256 of a blob.
pub fn integrity_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Both tiers behind one handle, dispatched on `BlobRef::tier`.
pub struct CheckpointStore {
    pool: Arc<MemoryPoolStore>,
    cold: Option<ColdStore>,
}

impl CheckpointStore {
    pub fn new(pool: Arc<MemoryPoolStore>, cold: Option<ColdStore>) -> Self {
        Self { pool, cold }
    }

    pub fn pool(&self) -> &Arc<MemoryPoolStore> {
        &self.pool
    }

    pub fn has_cold_tier(&self) -> bool {
        self.cold.is_some()
    }

    /// Store a checkpoint already protected from eviction.
    ///
    /// Cold blobs live on disk and are never evicted, so only the pool pins.
    pub async fn put_pinned(&self, tier: StorageTier, key: PoolKey, blob: Arc<[u8]>) -> Result<BlobRef> {
        match tier {
            StorageTier::Memory => self.pool.put_pinned(key, blob).await,
            StorageTier::Cold => self.cold()?.put(&key, &blob).await,
        }
    }

    pub async fn get(&self, blob_ref: &BlobRef) -> Result<Arc<[u8]>> {
        match blob_ref.tier {
            StorageTier::Memory => self.pool.get(blob_ref).await,
            StorageTier::Cold => self.cold()?.get(blob_ref).await.map(Arc::from),
        }
    }

    pub async fn remove(&self, blob_ref: &BlobRef) -> bool {
        match blob_ref.tier {
            StorageTier::Memory => self.pool.remove(blob_ref).await,
            StorageTier::Cold => match &self.cold {
                Some(cold) => cold.remove(blob_ref).await,
                None => false,
            },
        }
    }

    pub async fn unpin(&self, blob_ref: &BlobRef) {
        if blob_ref.tier == StorageTier::Memory {
            self.pool.unpin(blob_ref).await;
        }
    }

    fn cold(&self) -> Result<&ColdStore> {
        self.cold
            .as_ref()
            .ok_or_else(|| SnapshotError::Config("cold tier is not configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_hash_is_hex_sha256() {
        assert_eq!(
            integrity_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_cold_tier_without_root_is_config_error() {
        let store = CheckpointStore::new(
            Arc::new(MemoryPoolStore::new(64, EvictionPolicy::Reject)),
            None,
        );
        let key = PoolKey::new("web".into(), 1);
        let err = store
            .put_pinned(StorageTier::Cold, key, Arc::from(vec![1u8; 8]))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Config(_)));
    }

    #[tokio::test]
    async fn test_memory_checkpoint_is_pinned_on_arrival() {
        let store = CheckpointStore::new(
            Arc::new(MemoryPoolStore::new(6000, EvictionPolicy::OldestGenerationFirst)),
            None,
        );
        let current = store
            .put_pinned(StorageTier::Memory, PoolKey::new("web".into(), 1), Arc::from(vec![1u8; 4096]))
            .await
            .unwrap();

        // A later unpinned blob cannot push the checkpoint out
        assert!(store
            .pool()
            .put(PoolKey::new("api".into(), 1), Arc::from(vec![2u8; 4096]))
            .await
            .is_err());
        assert_eq!(store.get(&current).await.unwrap().len(), 4096);

        store.unpin(&current).await;
        store
            .pool()
            .put(PoolKey::new("api".into(), 1), Arc::from(vec![2u8; 4096]))
            .await
            .unwrap();
        assert!(store.get(&current).await.is_err());
    }
}
