//! Checkpoint/restore mechanisms
//!
//! The controller never shells out directly; every runtime goes through
//! [`CheckpointBackend`], chosen once at startup by [`build_backend`].

mod criu;
mod docker;
mod simulated;

pub use criu::CriuBackend;
pub use docker::DockerBackend;
pub use simulated::{SimulatedBackend, SimulatedStep};

use crate::config::ControllerConfig;
use crate::storage::integrity_hash;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idlesnap_common::{
    CheckpointErrorKind, InstanceHandle, InstanceId, RestoreErrorKind, Result, SnapshotError,
};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Criu,
    Simulated,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Docker => f.write_str("docker"),
            BackendKind::Criu => f.write_str("criu"),
            BackendKind::Simulated => f.write_str("simulated"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "criu" => Ok(BackendKind::Criu),
            "simulated" | "sim" => Ok(BackendKind::Simulated),
            other => Err(SnapshotError::Config(format!("unknown backend: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    /// Keep the instance running after the dump
    pub leave_running: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Identity the restored instance takes over
    pub target_identity: InstanceId,
    pub timeout: Duration,
}

/// Capability interface over an external snapshot mechanism.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Verify the runtime and its prerequisites are usable.
    async fn check_prerequisites(&self) -> Result<()>;

    /// Snapshot a running instance into a self-describing blob.
    async fn checkpoint(&self, instance: &InstanceId, options: &CheckpointOptions) -> Result<Vec<u8>>;

    /// Rebuild a running instance from a blob produced by `checkpoint`.
    async fn restore(&self, blob: &[u8], options: &RestoreOptions) -> Result<InstanceHandle>;

    /// Instances the runtime currently knows about.
    async fn list(&self) -> Result<Vec<InstanceId>>;

    /// Park an instance after a successful checkpoint.
    async fn stop(&self, instance: &InstanceId) -> Result<()>;

    /// Write a named checkpoint into `dir` without packing it.
    async fn dump_named(
        &self,
        instance: &InstanceId,
        dir: &Path,
        name: &str,
        options: &CheckpointOptions,
    ) -> Result<()>;

    /// Restore the named checkpoint found in `dir`.
    async fn restore_named(
        &self,
        name: &str,
        dir: &Path,
        options: &RestoreOptions,
    ) -> Result<InstanceHandle>;
}

/// Select the configured backend and check its prerequisites.
pub async fn build_backend(config: &ControllerConfig) -> Result<Arc<dyn CheckpointBackend>> {
    let backend: Arc<dyn CheckpointBackend> = match config.backend {
        BackendKind::Docker => Arc::new(DockerBackend::new(config.docker.clone())),
        BackendKind::Criu => Arc::new(CriuBackend::new(config.criu.clone()).await?),
        BackendKind::Simulated => Arc::new(SimulatedBackend::new()),
    };
    backend.check_prerequisites().await?;
    info!("Checkpoint backend ready: {}", backend.kind());
    Ok(backend)
}

/// Sidecar stored next to the images inside every packed blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub instance_id: InstanceId,
    pub backend: BackendKind,
    pub checkpoint_name: String,
    pub created_at: DateTime<Utc>,
}

const METADATA_FILE: &str = "metadata.json";
const IMAGES_DIR: &str = "images";

/// Pack a checkpoint image directory and its metadata into a tar blob.
///
/// Entries are sorted and written with fixed mode, owner and mtime, so the
/// same files always pack to the same bytes.
pub(crate) fn pack_images(images: &Path, metadata: &ImageMetadata) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_vec_pretty(metadata)?;
    pack_tree(images, &json)
}

fn pack_tree(images: &Path, metadata_json: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut files = Vec::new();
    collect_files(images, Path::new(""), &mut files)
        .with_context(|| format!("Failed to pack {}", images.display()))?;
    files.sort();

    let mut builder = tar::Builder::new(Vec::new());
    for relative in files {
        let data = std::fs::read(images.join(&relative))
            .with_context(|| format!("Failed to read image {}", relative.display()))?;
        append_file(&mut builder, &Path::new(IMAGES_DIR).join(&relative), &data)?;
    }
    append_file(&mut builder, Path::new(METADATA_FILE), metadata_json)?;
    Ok(builder.into_inner()?)
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

fn collect_files(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let path = relative.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// A blob unpacked onto disk, ready to hand to the runtime.
#[derive(Debug)]
pub(crate) struct UnpackedImages {
    pub metadata: ImageMetadata,
    pub images: PathBuf,
    /// Hash of the blob rebuilt from what actually landed on disk; equals the
    /// source blob's hash only if nothing was lost or altered on the way.
    pub content_hash: String,
}

/// Unpack a blob produced by [`pack_images`] into `dest`.
pub(crate) fn unpack_images(blob: &[u8], dest: &Path) -> anyhow::Result<UnpackedImages> {
    let mut archive = tar::Archive::new(blob);
    archive.unpack(dest).context("Checkpoint archive is unreadable")?;

    let raw = std::fs::read(dest.join(METADATA_FILE)).context("Checkpoint metadata is missing")?;
    let metadata: ImageMetadata =
        serde_json::from_slice(&raw).context("Checkpoint metadata is malformed")?;

    let images = dest.join(IMAGES_DIR);
    std::fs::create_dir_all(&images)?;
    let rebuilt = pack_tree(&images, &raw)?;
    Ok(UnpackedImages {
        metadata,
        images,
        content_hash: integrity_hash(&rebuilt),
    })
}

/// The configured binary if set, otherwise the first `name` on `search_path`.
pub(crate) fn resolve_binary(
    configured: Option<&Path>,
    name: &str,
    search_path: Option<&OsStr>,
) -> Result<PathBuf> {
    if let Some(path) = configured {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(SnapshotError::Prerequisite(format!(
                "configured {name} binary {} does not exist",
                path.display()
            )))
        };
    }

    search_path
        .map(|paths| std::env::split_paths(paths).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            SnapshotError::Prerequisite(format!(
                "{name} is not on PATH; set its binary path in the configuration"
            ))
        })
}

/// Classify a failed dump from the runtime's stderr.
pub(crate) fn classify_checkpoint_failure(stderr: &str) -> CheckpointErrorKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("busy") || lower.contains("locked") || lower.contains("in progress") {
        CheckpointErrorKind::Busy
    } else {
        CheckpointErrorKind::Unsupported
    }
}

/// Classify a failed restore from the runtime's stderr.
///
/// Anything unrecognised is treated as a corrupt image.
pub(crate) fn classify_restore_failure(stderr: &str) -> RestoreErrorKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("busy") || lower.contains("locked") || lower.contains("in progress") {
        RestoreErrorKind::Busy
    } else if lower.contains("already") || lower.contains("exists") || lower.contains("conflict") {
        RestoreErrorKind::Conflict
    } else if lower.contains("no such") || lower.contains("not found") {
        RestoreErrorKind::NotFound
    } else {
        RestoreErrorKind::Corrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert_eq!("sim".parse::<BackendKind>().unwrap(), BackendKind::Simulated);
        assert!("firecracker".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            classify_checkpoint_failure("Error: device or resource busy"),
            CheckpointErrorKind::Busy
        );
        assert_eq!(
            classify_checkpoint_failure("checkpoint only supported with experimental daemon"),
            CheckpointErrorKind::Unsupported
        );
        assert_eq!(
            classify_restore_failure("container web is already running"),
            RestoreErrorKind::Conflict
        );
        assert_eq!(
            classify_restore_failure("open images: No such file or directory"),
            RestoreErrorKind::NotFound
        );
        assert_eq!(classify_restore_failure("bad magic"), RestoreErrorKind::Corrupt);
    }

    fn metadata() -> ImageMetadata {
        ImageMetadata {
            instance_id: InstanceId::new("web"),
            backend: BackendKind::Criu,
            checkpoint_name: "ckpt-1".into(),
            created_at: Utc::now(),
        }
    }

    fn image_dir() -> TempDir {
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("pages-1.img"), vec![1u8; 4096]).unwrap();
        std::fs::write(source.path().join("pstree.img"), b"tree").unwrap();
        std::fs::create_dir(source.path().join("net")).unwrap();
        std::fs::write(source.path().join("net").join("ifaddr.img"), b"lo").unwrap();
        source
    }

    #[test]
    fn test_pack_unpack_images() {
        let source = image_dir();
        let metadata = metadata();
        let blob = pack_images(source.path(), &metadata).unwrap();

        let dest = TempDir::new().unwrap();
        let unpacked = unpack_images(&blob, dest.path()).unwrap();
        assert_eq!(unpacked.metadata, metadata);
        assert_eq!(std::fs::read(unpacked.images.join("pstree.img")).unwrap(), b"tree");
        assert_eq!(
            std::fs::read(unpacked.images.join("net").join("ifaddr.img")).unwrap(),
            b"lo"
        );
        assert_eq!(unpacked.content_hash, integrity_hash(&blob));
    }

    #[test]
    fn test_packing_is_deterministic() {
        let source = image_dir();
        let metadata = metadata();
        let first = pack_images(source.path(), &metadata).unwrap();

        // Touching mtimes and modes must not change the blob
        let image = source.path().join("pstree.img");
        std::fs::write(&image, b"tree").unwrap();
        std::fs::set_permissions(&image, std::fs::Permissions::from_mode(0o600)).unwrap();

        assert_eq!(pack_images(source.path(), &metadata).unwrap(), first);
    }

    #[test]
    fn test_unfaithful_unpack_changes_content_hash() {
        let source = image_dir();
        let json = serde_json::to_vec_pretty(&metadata()).unwrap();
        let mut blob = pack_tree(source.path(), &json).unwrap();

        // Rewrite the archive with a duplicate entry that shadows the first
        let mut builder = tar::Builder::new(Vec::new());
        let mut archive = tar::Archive::new(blob.as_slice());
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let mut header = entry.header().clone();
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut data).unwrap();
            builder.append(&header, data.as_slice()).unwrap();
            if entry.path().unwrap().ends_with("pstree.img") {
                header.set_size(5);
                header.set_cksum();
                builder.append(&header, &b"stale"[..]).unwrap();
            }
        }
        blob = builder.into_inner().unwrap();

        let dest = TempDir::new().unwrap();
        let unpacked = unpack_images(&blob, dest.path()).unwrap();
        assert_eq!(std::fs::read(unpacked.images.join("pstree.img")).unwrap(), b"stale");
        assert_ne!(unpacked.content_hash, integrity_hash(&blob));
    }

    #[test]
    fn test_unpack_garbage_fails() {
        let dest = TempDir::new().unwrap();
        assert!(unpack_images(b"definitely not a tar archive", dest.path()).is_err());
    }

    #[test]
    fn test_resolve_configured_binary() {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("criu");
        std::fs::write(&binary, b"").unwrap();

        assert_eq!(resolve_binary(Some(&binary), "criu", None).unwrap(), binary);
        let err = resolve_binary(Some(Path::new("/nonexistent/criu")), "criu", None).unwrap_err();
        assert!(matches!(err, SnapshotError::Prerequisite(_)));
    }

    #[test]
    fn test_resolve_binary_on_search_path() {
        let empty = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        std::fs::write(tools.path().join("criu"), b"").unwrap();
        let search = std::env::join_paths([empty.path(), tools.path()]).unwrap();

        assert_eq!(
            resolve_binary(None, "criu", Some(&search)).unwrap(),
            tools.path().join("criu")
        );
        assert!(resolve_binary(None, "docker", Some(&search)).is_err());
        assert!(resolve_binary(None, "criu", None).is_err());
    }
}
