//! Local-disk tier: zstd-compressed blobs, written atomically

use super::PoolKey;
use anyhow::{anyhow, Context};
use idlesnap_common::{BlobRef, Result, SnapshotError, StorageTier};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const ZSTD_LEVEL: i32 = 3;

pub struct ColdStore {
    root: PathBuf,
}

impl ColdStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn put(&self, key: &PoolKey, data: &[u8]) -> Result<BlobRef> {
        let storage_key = key.storage_key();
        let path = self.path_for(&storage_key);
        self.write_compressed(&path, data)
            .await
            .map_err(|e| SnapshotError::Io(format!("{e:#}")))?;
        Ok(BlobRef::new(StorageTier::Cold, storage_key))
    }

    pub async fn get(&self, blob_ref: &BlobRef) -> Result<Vec<u8>> {
        let path = self.path_for(&blob_ref.key);
        if blob_ref.tier != StorageTier::Cold || !path.exists() {
            return Err(SnapshotError::BlobNotFound(blob_ref.to_string()));
        }
        self.read_compressed(&path)
            .await
            .map_err(|e| SnapshotError::Io(format!("{e:#}")))
    }

    pub async fn exists(&self, blob_ref: &BlobRef) -> bool {
        blob_ref.tier == StorageTier::Cold && self.path_for(&blob_ref.key).exists()
    }

    pub async fn remove(&self, blob_ref: &BlobRef) -> bool {
        let path = self.path_for(&blob_ref.key);
        fs::remove_file(&path).await.is_ok()
    }

    async fn write_compressed(&self, path: &Path, data: &[u8]) -> anyhow::Result<()> {
        let compressed = zstd::encode_all(data, ZSTD_LEVEL).context("zstd compression failed")?;

        // Write atomically
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        file.write_all(&compressed).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, path).await?;

        debug!(
            "Stored cold blob {} ({} bytes, {} compressed)",
            path.display(),
            data.len(),
            compressed.len()
        );
        Ok(())
    }

    async fn read_compressed(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        let compressed = fs::read(path)
            .await
            .map_err(|e| anyhow!("Failed to read blob {}: {}", path.display(), e))?;
        zstd::decode_all(compressed.as_slice()).context("zstd decompression failed")
    }

    fn path_for(&self, storage_key: &str) -> PathBuf {
        let file_name: String = storage_key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '.'
                }
            })
            .collect();
        self.root.join(format!("{file_name}.zst"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cold_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ColdStore::new(dir.path()).await.unwrap();

        let data = vec![42u8; 64 * 1024];
        let blob_ref = store.put(&PoolKey::new("api".into(), 3), &data).await.unwrap();

        assert_eq!(blob_ref.tier, StorageTier::Cold);
        assert!(store.exists(&blob_ref).await);
        assert_eq!(store.get(&blob_ref).await.unwrap(), data);

        // Highly repetitive data should compress well below its raw size
        let on_disk = std::fs::metadata(store.path_for(&blob_ref.key)).unwrap().len();
        assert!(on_disk < data.len() as u64 / 10);
    }

    #[tokio::test]
    async fn test_cold_store_missing_and_removed() {
        let dir = TempDir::new().unwrap();
        let store = ColdStore::new(dir.path()).await.unwrap();
        let blob_ref = store.put(&PoolKey::new("api".into(), 1), b"state").await.unwrap();

        assert!(store.remove(&blob_ref).await);
        assert!(matches!(
            store.get(&blob_ref).await,
            Err(SnapshotError::BlobNotFound(_))
        ));
    }
}
