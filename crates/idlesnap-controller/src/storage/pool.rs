//! Bounded in-memory pool for checkpoint blobs

use idlesnap_common::{BlobRef, InstanceId, Result, SnapshotError, StorageTier};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What `put` does when the pool is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Drop superseded generations first, oldest first
    #[default]
    OldestGenerationFirst,
    /// Drop the least recently read or written blob first
    LeastRecentlyUsed,
    /// Never evict, fail the put with `StorageCapacity`
    Reject,
}

/// One checkpoint per (instance, generation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub instance_id: InstanceId,
    pub generation: u64,
}

impl PoolKey {
    pub fn new(instance_id: InstanceId, generation: u64) -> Self {
        Self {
            instance_id,
            generation,
        }
    }

    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.instance_id, self.generation)
    }
}

#[derive(Debug)]
struct PoolEntry {
    key: PoolKey,
    data: Arc<[u8]>,
    inserted_at: Instant,
    expires_at: Option<Instant>,
    pinned: bool,
}

impl PoolEntry {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

struct PoolInner {
    entries: HashMap<String, PoolEntry>,
    recency: LruCache<String, ()>,
    used_bytes: u64,
    evictions: u64,
    rejected_puts: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub entries: usize,
    pub pinned: usize,
    pub evictions: u64,
    pub rejected_puts: u64,
}

/// Shared, capacity-bounded blob store.
///
/// Pinned entries (the current checkpoint of a suspended instance) are never
/// evicted or expired, so a full pool can refuse new blobs but never loses a
/// checkpoint something still depends on.
pub struct MemoryPoolStore {
    capacity_bytes: u64,
    policy: EvictionPolicy,
    default_ttl: Option<Duration>,
    inner: Mutex<PoolInner>,
}

impl MemoryPoolStore {
    pub fn new(capacity_bytes: u64, policy: EvictionPolicy) -> Self {
        Self {
            capacity_bytes,
            policy,
            default_ttl: None,
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                recency: LruCache::unbounded(),
                used_bytes: 0,
                evictions: 0,
                rejected_puts: 0,
            }),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Store a blob, evicting per the configured policy if the pool is full.
    pub async fn put(&self, key: PoolKey, blob: Arc<[u8]>) -> Result<BlobRef> {
        self.insert(key, blob, false).await
    }

    /// Store a blob that is pinned from the moment it lands.
    ///
    /// A separate `put` then `pin` leaves a window where a concurrent put can
    /// evict the fresh blob.
    pub async fn put_pinned(&self, key: PoolKey, blob: Arc<[u8]>) -> Result<BlobRef> {
        self.insert(key, blob, true).await
    }

    async fn insert(&self, key: PoolKey, blob: Arc<[u8]>, pinned: bool) -> Result<BlobRef> {
        let size = blob.len() as u64;
        let storage_key = key.storage_key();
        let mut inner = self.inner.lock().await;

        // Same (instance, generation) overwrites in place, never over a pinned blob
        let existing = inner
            .entries
            .get(&storage_key)
            .map(|previous| (previous.pinned, previous.size()));
        let replaced = match existing {
            Some((true, _)) => {
                inner.rejected_puts += 1;
                return Err(SnapshotError::Internal(format!(
                    "pooled blob {storage_key} is pinned and cannot be overwritten"
                )));
            }
            Some((false, previous)) => previous,
            None => 0,
        };

        let available = self
            .capacity_bytes
            .saturating_sub(inner.used_bytes)
            .saturating_add(replaced);
        let victims = if size <= available {
            Some(Vec::new())
        } else if size > self.capacity_bytes {
            None
        } else {
            Self::select_victims(&inner, self.policy, size - available, Some(storage_key.as_str()))
        };
        let Some(victims) = victims else {
            inner.rejected_puts += 1;
            warn!(
                "Memory pool full: {} bytes requested for {}, {} available",
                size, storage_key, available
            );
            return Err(SnapshotError::StorageCapacity {
                requested: size,
                available,
            });
        };

        Self::drop_entry(&mut inner, &storage_key);
        for victim in victims {
            Self::drop_entry(&mut inner, &victim);
            inner.evictions += 1;
            debug!("Evicted pooled blob {} to make room for {}", victim, storage_key);
        }

        let now = Instant::now();
        inner.used_bytes += size;
        inner.recency.put(storage_key.clone(), ());
        inner.entries.insert(
            storage_key.clone(),
            PoolEntry {
                key,
                data: blob,
                inserted_at: now,
                expires_at: self.default_ttl.map(|ttl| now + ttl),
                pinned,
            },
        );

        debug!(
            "Pooled blob {} ({} bytes, {} used, pinned: {})",
            storage_key, size, inner.used_bytes, pinned
        );
        Ok(BlobRef::new(StorageTier::Memory, storage_key))
    }

    pub async fn get(&self, blob_ref: &BlobRef) -> Result<Arc<[u8]>> {
        let mut inner = self.inner.lock().await;
        let data = inner
            .entries
            .get(&blob_ref.key)
            .filter(|_| blob_ref.tier == StorageTier::Memory)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| SnapshotError::BlobNotFound(blob_ref.to_string()))?;
        inner.recency.promote(&blob_ref.key);
        Ok(data)
    }

    pub async fn contains(&self, blob_ref: &BlobRef) -> bool {
        blob_ref.tier == StorageTier::Memory
            && self.inner.lock().await.entries.contains_key(&blob_ref.key)
    }

    /// Make a blob eligible for eviction and expiry again.
    pub async fn unpin(&self, blob_ref: &BlobRef) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.entries.get_mut(&blob_ref.key) {
            Some(entry) => {
                entry.pinned = false;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, blob_ref: &BlobRef) -> bool {
        let mut inner = self.inner.lock().await;
        Self::drop_entry(&mut inner, &blob_ref.key)
    }

    /// Free at least `bytes_needed` bytes of unpinned blobs.
    ///
    /// Nothing is evicted unless the whole amount can be freed.
    pub async fn evict(&self, policy: EvictionPolicy, bytes_needed: u64) -> Vec<BlobRef> {
        let mut inner = self.inner.lock().await;
        let Some(victims) = Self::select_victims(&inner, policy, bytes_needed, None) else {
            return Vec::new();
        };

        let mut evicted = Vec::with_capacity(victims.len());
        for victim in victims {
            if Self::drop_entry(&mut inner, &victim) {
                inner.evictions += 1;
                evicted.push(BlobRef::new(StorageTier::Memory, victim));
            }
        }
        if !evicted.is_empty() {
            info!("Evicted {} pooled blobs ({:?})", evicted.len(), policy);
        }
        evicted
    }

    /// Drop unpinned blobs whose TTL has passed.
    pub async fn purge_expired(&self, now: Instant) -> Vec<BlobRef> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.pinned && entry.expires_at.is_some_and(|at| now >= at))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter(|key| Self::drop_entry(&mut inner, key))
            .map(|key| BlobRef::new(StorageTier::Memory, key))
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            capacity_bytes: self.capacity_bytes,
            used_bytes: inner.used_bytes,
            entries: inner.entries.len(),
            pinned: inner.entries.values().filter(|e| e.pinned).count(),
            evictions: inner.evictions,
            rejected_puts: inner.rejected_puts,
        }
    }

    fn select_victims(
        inner: &PoolInner,
        policy: EvictionPolicy,
        bytes_needed: u64,
        exclude: Option<&str>,
    ) -> Option<Vec<String>> {
        if bytes_needed == 0 {
            return Some(Vec::new());
        }

        let candidates: Vec<&String> = match policy {
            EvictionPolicy::Reject => return None,
            EvictionPolicy::OldestGenerationFirst => {
                let mut unpinned: Vec<(&String, &PoolEntry)> =
                    inner.entries.iter().filter(|(_, e)| !e.pinned).collect();
                unpinned.sort_by_key(|(_, e)| (e.key.generation, e.inserted_at));
                unpinned.into_iter().map(|(k, _)| k).collect()
            }
            EvictionPolicy::LeastRecentlyUsed => inner
                .recency
                .iter()
                .rev()
                .map(|(k, _)| k)
                .filter(|k| inner.entries.get(*k).is_some_and(|e| !e.pinned))
                .collect(),
        };

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for key in candidates {
            if freed >= bytes_needed {
                break;
            }
            if exclude == Some(key.as_str()) {
                continue;
            }
            if let Some(entry) = inner.entries.get(key) {
                freed += entry.size();
                victims.push(key.clone());
            }
        }

        (freed >= bytes_needed).then_some(victims)
    }

    fn drop_entry(inner: &mut PoolInner, key: &str) -> bool {
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.used_bytes -= entry.size();
                inner.recency.pop(key);
                true
            }
            None => false,
        }
    }
}
