//! CRIU (Checkpoint/Restore In Userspace) backend
//!
//! Instances are process trees addressed by their root PID.

use super::{
    classify_checkpoint_failure, classify_restore_failure, pack_images, resolve_binary,
    unpack_images, BackendKind, CheckpointBackend, CheckpointOptions, ImageMetadata, RestoreOptions,
};
use crate::config::CriuSettings;
use async_trait::async_trait;
use chrono::Utc;
use idlesnap_common::{
    CheckpointErrorKind, InstanceHandle, InstanceId, RestoreErrorKind, Result, SnapshotError,
};
use std::path::{Path, PathBuf};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info, warn};

pub struct CriuBackend {
    binary_path: PathBuf,
    settings: CriuSettings,
}

impl CriuBackend {
    /// Resolve the binary and prepare the images directory.
    ///
    /// Capability validation happens in `check_prerequisites`.
    pub async fn new(settings: CriuSettings) -> Result<Self> {
        let search_path = std::env::var_os("PATH");
        let binary_path = resolve_binary(settings.binary.as_deref(), "criu", search_path.as_deref())?;

        tokio::fs::create_dir_all(&settings.images_dir).await?;
        if let Some(log_dir) = &settings.log_dir {
            tokio::fs::create_dir_all(log_dir).await?;
        }

        info!("CRIU backend initialized with binary: {:?}", binary_path);
        Ok(Self {
            binary_path,
            settings,
        })
    }

    fn pid_of(instance: &InstanceId) -> Result<u32> {
        instance.as_str().parse::<u32>().map_err(|_| {
            SnapshotError::checkpoint(
                instance,
                CheckpointErrorKind::Unsupported,
                "CRIU instances are addressed by root PID",
            )
        })
    }

    fn common_flags(&self, cmd: &mut AsyncCommand) {
        if self.settings.tcp_established {
            cmd.arg("--tcp-established");
        }
        if self.settings.shell_job {
            cmd.arg("--shell-job");
        }
        if self.settings.ext_unix_sk {
            cmd.arg("--ext-unix-sk");
        }
        if self.settings.file_locks {
            cmd.arg("--file-locks");
        }
    }

    fn log_file(&self, cmd: &mut AsyncCommand, name: &str, action: &str) -> Option<PathBuf> {
        let log_dir = self.settings.log_dir.as_ref()?;
        let log_file = log_dir.join(format!("{name}-{action}.log"));
        cmd.arg("--log-file").arg(&log_file);
        Some(log_file)
    }

    async fn dump_log(log_path: Option<&Path>) {
        if let Some(log_path) = log_path {
            if let Ok(log_content) = tokio::fs::read_to_string(log_path).await {
                error!("CRIU log content:\n{}", log_content);
            }
        }
    }
}

#[async_trait]
impl CheckpointBackend for CriuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Criu
    }

    async fn check_prerequisites(&self) -> Result<()> {
        let output = AsyncCommand::new(&self.binary_path)
            .arg("check")
            .output()
            .await
            .map_err(|e| SnapshotError::Prerequisite(format!("failed to run criu check: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("CRIU capability check warnings: {}", stderr);

            // Warnings alone are tolerated
            if stderr.contains("Error") || stderr.contains("FAIL") {
                return Err(SnapshotError::Prerequisite(format!(
                    "CRIU capability check failed: {}",
                    stderr.trim()
                )));
            }
        }

        debug!("CRIU capabilities validated successfully");
        Ok(())
    }

    async fn checkpoint(&self, instance: &InstanceId, options: &CheckpointOptions) -> Result<Vec<u8>> {
        let workdir = tempfile::tempdir_in(&self.settings.images_dir)?;
        let name = format!("{}-{}", instance, uuid::Uuid::new_v4().simple());

        self.dump_named(instance, workdir.path(), &name, options).await?;

        let metadata = ImageMetadata {
            instance_id: instance.clone(),
            backend: BackendKind::Criu,
            checkpoint_name: name,
            created_at: Utc::now(),
        };
        let images = workdir.path().join(&metadata.checkpoint_name);
        tokio::task::spawn_blocking(move || pack_images(&images, &metadata))
            .await
            .map_err(|e| SnapshotError::Internal(e.to_string()))?
            .map_err(|e| {
                SnapshotError::checkpoint(instance, CheckpointErrorKind::Unsupported, format!("{e:#}"))
            })
    }

    async fn restore(&self, blob: &[u8], options: &RestoreOptions) -> Result<InstanceHandle> {
        let target = &options.target_identity;
        let workdir = tempfile::tempdir_in(&self.settings.images_dir)?;
        let dest = workdir.path().to_path_buf();
        let owned = blob.to_vec();

        let unpacked = tokio::task::spawn_blocking(move || unpack_images(&owned, &dest))
            .await
            .map_err(|e| SnapshotError::Internal(e.to_string()))?
            .map_err(|e| SnapshotError::restore(target, RestoreErrorKind::Corrupt, format!("{e:#}")))?;

        let parent = unpacked
            .images
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| workdir.path().to_path_buf());
        let name = &unpacked.metadata.checkpoint_name;
        tokio::fs::rename(&unpacked.images, parent.join(name)).await?;

        let mut handle = self.restore_named(name, &parent, options).await?;
        handle.content_hash = unpacked.content_hash;
        Ok(handle)
    }

    /// Named checkpoints kept in the images directory.
    async fn list(&self) -> Result<Vec<InstanceId>> {
        let mut checkpoints = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.settings.images_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        checkpoints.push(InstanceId::from(name));
                    }
                }
            }
        }

        checkpoints.sort();
        Ok(checkpoints)
    }

    async fn stop(&self, instance: &InstanceId) -> Result<()> {
        let pid = Self::pid_of(instance)?;
        let output = AsyncCommand::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SnapshotError::checkpoint(
                instance,
                CheckpointErrorKind::Busy,
                format!("failed to stop PID {}: {}", pid, stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn dump_named(
        &self,
        instance: &InstanceId,
        dir: &Path,
        name: &str,
        options: &CheckpointOptions,
    ) -> Result<()> {
        let pid = Self::pid_of(instance)?;
        let images_path = dir.join(name);
        tokio::fs::create_dir_all(&images_path).await?;

        info!("Starting CRIU checkpoint for PID {} -> {}", pid, name);

        let mut cmd = AsyncCommand::new(&self.binary_path);
        cmd.arg("dump")
            .arg("--tree")
            .arg(pid.to_string())
            .arg("--images-dir")
            .arg(&images_path);
        if options.leave_running {
            cmd.arg("--leave-running");
        }
        self.common_flags(&mut cmd);
        let log_path = self.log_file(&mut cmd, name, "checkpoint");
        cmd.kill_on_drop(true);

        debug!("CRIU checkpoint command: {:?}", cmd);

        let output = match tokio::time::timeout(options.timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(SnapshotError::checkpoint(
                    instance,
                    CheckpointErrorKind::Timeout,
                    format!("criu dump exceeded {:?}", options.timeout),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("CRIU checkpoint failed for PID {}: {}", pid, stderr);
            Self::dump_log(log_path.as_deref()).await;
            return Err(SnapshotError::checkpoint(
                instance,
                classify_checkpoint_failure(&stderr),
                stderr.trim().to_string(),
            ));
        }

        Ok(())
    }

    async fn restore_named(
        &self,
        name: &str,
        dir: &Path,
        options: &RestoreOptions,
    ) -> Result<InstanceHandle> {
        let target = &options.target_identity;
        let images_path = dir.join(name);

        if !images_path.exists() {
            return Err(SnapshotError::restore(
                target,
                RestoreErrorKind::NotFound,
                format!("Checkpoint images not found: {:?}", images_path),
            ));
        }

        let pidfile = images_path.join("restored.pid");
        let mut cmd = AsyncCommand::new(&self.binary_path);
        cmd.arg("restore")
            .arg("--images-dir")
            .arg(&images_path)
            .arg("--restore-detached")
            .arg("--pidfile")
            .arg(&pidfile);
        self.common_flags(&mut cmd);
        let log_path = self.log_file(&mut cmd, name, "restore");
        cmd.current_dir(dir).kill_on_drop(true);

        debug!("CRIU restore command: {:?}", cmd);

        let output = match tokio::time::timeout(options.timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(SnapshotError::restore(
                    target,
                    RestoreErrorKind::Timeout,
                    format!("criu restore exceeded {:?}", options.timeout),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("CRIU restore failed for {}: {}", name, stderr);
            Self::dump_log(log_path.as_deref()).await;
            return Err(SnapshotError::restore(
                target,
                classify_restore_failure(&stderr),
                stderr.trim().to_string(),
            ));
        }

        let new_pid = tokio::fs::read_to_string(&pidfile)
            .await
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .or_else(|| extract_restored_pid(&String::from_utf8_lossy(&output.stdout)))
            .ok_or_else(|| {
                SnapshotError::restore(
                    target,
                    RestoreErrorKind::Corrupt,
                    "could not determine the restored PID",
                )
            })?;

        info!("CRIU restore of {} completed: PID {}", name, new_pid);
        Ok(InstanceHandle {
            instance_id: target.clone(),
            identity: new_pid.to_string(),
            content_hash: String::new(),
            restored_at: Utc::now(),
        })
    }
}

fn extract_restored_pid(output: &str) -> Option<u32> {
    output
        .split_whitespace()
        .filter_map(|word| word.parse::<u32>().ok())
        .find(|pid| *pid > 0)
}
