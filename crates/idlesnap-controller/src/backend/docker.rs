//! Docker `checkpoint` backend (CRIU underneath, experimental daemon required)

use super::{
    classify_checkpoint_failure, classify_restore_failure, pack_images, resolve_binary,
    unpack_images, BackendKind, CheckpointBackend, CheckpointOptions, ImageMetadata, RestoreOptions,
};
use crate::config::DockerSettings;
use async_trait::async_trait;
use chrono::Utc;
use idlesnap_common::{
    CheckpointErrorKind, InstanceHandle, InstanceId, RestoreErrorKind, Result, SnapshotError,
};
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info, warn};

pub struct DockerBackend {
    settings: DockerSettings,
}

impl DockerBackend {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }

    fn command(&self) -> AsyncCommand {
        AsyncCommand::new(&self.settings.binary)
    }

    async fn run(&self, mut cmd: AsyncCommand, limit: Duration) -> std::io::Result<Option<Output>> {
        debug!("docker command: {:?}", cmd);
        cmd.kill_on_drop(true);
        match tokio::time::timeout(limit, cmd.output()).await {
            Ok(output) => output.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn checkpoint_command(&self, instance: &InstanceId, dir: &Path, name: &str, leave_running: bool) -> AsyncCommand {
        let mut cmd = self.command();
        cmd.arg("checkpoint").arg("create");
        if leave_running {
            cmd.arg("--leave-running");
        }
        cmd.arg("--checkpoint-dir").arg(dir).arg(instance.as_str()).arg(name);
        cmd
    }

    fn restore_command(&self, target: &InstanceId, dir: &Path, name: &str) -> AsyncCommand {
        let mut cmd = self.command();
        cmd.arg("start")
            .arg("--checkpoint")
            .arg(name)
            .arg("--checkpoint-dir")
            .arg(dir)
            .arg(target.as_str());
        cmd
    }

    async fn container_id(&self, name: &InstanceId) -> Option<String> {
        let mut cmd = self.command();
        cmd.arg("inspect").arg("--format").arg("{{.Id}}").arg(name.as_str());
        match cmd.output().await {
            Ok(output) if output.status.success() => {
                let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!id.is_empty()).then_some(id)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl CheckpointBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn check_prerequisites(&self) -> Result<()> {
        let output = self
            .command()
            .arg("info")
            .arg("--format")
            .arg("{{.ExperimentalBuild}}")
            .output()
            .await
            .map_err(|e| SnapshotError::Prerequisite(format!("docker is not available: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SnapshotError::Prerequisite(format!(
                "docker daemon unreachable: {}",
                stderr.trim()
            )));
        }

        let experimental = String::from_utf8_lossy(&output.stdout);
        if experimental.trim() != "true" {
            return Err(SnapshotError::Prerequisite(
                "docker checkpoint requires the daemon to run with experimental features".into(),
            ));
        }

        // The daemon delegates to CRIU, so it must be installed as well
        let search_path = std::env::var_os("PATH");
        resolve_binary(None, "criu", search_path.as_deref())?;

        debug!("Docker checkpoint support validated");
        Ok(())
    }

    async fn checkpoint(&self, instance: &InstanceId, options: &CheckpointOptions) -> Result<Vec<u8>> {
        let workdir = tempfile::tempdir()?;
        let name = format!("idlesnap-{}", uuid::Uuid::new_v4().simple());

        self.dump_named(instance, workdir.path(), &name, options).await?;

        let metadata = ImageMetadata {
            instance_id: instance.clone(),
            backend: BackendKind::Docker,
            checkpoint_name: name.clone(),
            created_at: Utc::now(),
        };
        let images = workdir.path().join(&name);
        let blob = tokio::task::spawn_blocking(move || pack_images(&images, &metadata))
            .await
            .map_err(|e| SnapshotError::Internal(e.to_string()))?
            .map_err(|e| {
                SnapshotError::checkpoint(instance, CheckpointErrorKind::Unsupported, format!("{e:#}"))
            })?;

        info!("Packed docker checkpoint {} of {} ({} bytes)", name, instance, blob.len());
        Ok(blob)
    }

    async fn restore(&self, blob: &[u8], options: &RestoreOptions) -> Result<InstanceHandle> {
        let target = &options.target_identity;
        let workdir = tempfile::tempdir()?;
        let dest = workdir.path().to_path_buf();
        let owned = blob.to_vec();

        let unpacked = tokio::task::spawn_blocking(move || unpack_images(&owned, &dest))
            .await
            .map_err(|e| SnapshotError::Internal(e.to_string()))?
            .map_err(|e| SnapshotError::restore(target, RestoreErrorKind::Corrupt, format!("{e:#}")))?;

        // Docker expects <checkpoint-dir>/<name>/...
        let checkpoint_dir = workdir.path().join("checkpoints");
        let name = &unpacked.metadata.checkpoint_name;
        tokio::fs::create_dir_all(&checkpoint_dir).await?;
        tokio::fs::rename(&unpacked.images, checkpoint_dir.join(name)).await?;

        let mut handle = self.restore_named(name, &checkpoint_dir, options).await?;
        handle.content_hash = unpacked.content_hash;
        Ok(handle)
    }

    async fn list(&self) -> Result<Vec<InstanceId>> {
        let output = self
            .command()
            .arg("ps")
            .arg("--all")
            .arg("--format")
            .arg("{{.Names}}")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SnapshotError::Io(format!("docker ps failed: {}", stderr.trim())));
        }

        Ok(parse_container_names(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn stop(&self, instance: &InstanceId) -> Result<()> {
        let output = self.command().arg("stop").arg(instance.as_str()).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SnapshotError::checkpoint(
                instance,
                classify_checkpoint_failure(&stderr),
                format!("docker stop failed: {}", stderr.trim()),
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
        tokio::fs::create_dir_all(dir).await?;

        let cmd = self.checkpoint_command(instance, dir, name, options.leave_running);
        let output = match self.run(cmd, options.timeout).await? {
            Some(output) => output,
            None => {
                return Err(SnapshotError::checkpoint(
                    instance,
                    CheckpointErrorKind::Timeout,
                    format!("docker checkpoint exceeded {:?}", options.timeout),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("docker checkpoint failed for {}: {}", instance, stderr.trim());
            return Err(SnapshotError::checkpoint(
                instance,
                classify_checkpoint_failure(&stderr),
                stderr.trim().to_string(),
            ));
        }

        info!("Created docker checkpoint {} for {} in {}", name, instance, dir.display());
        Ok(())
    }

    async fn restore_named(
        &self,
        name: &str,
        dir: &Path,
        options: &RestoreOptions,
    ) -> Result<InstanceHandle> {
        let target = &options.target_identity;
        if !dir.join(name).exists() {
            return Err(SnapshotError::restore(
                target,
                RestoreErrorKind::NotFound,
                format!("checkpoint {} not found in {}", name, dir.display()),
            ));
        }

        let cmd = self.restore_command(target, dir, name);
        let output = match self.run(cmd, options.timeout).await? {
            Some(output) => output,
            None => {
                return Err(SnapshotError::restore(
                    target,
                    RestoreErrorKind::Timeout,
                    format!("docker start exceeded {:?}", options.timeout),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("docker restore of {} failed: {}", target, stderr.trim());
            return Err(SnapshotError::restore(
                target,
                classify_restore_failure(&stderr),
                stderr.trim().to_string(),
            ));
        }

        let identity = self
            .container_id(target)
            .await
            .unwrap_or_else(|| target.to_string());

        info!("Restored {} from docker checkpoint {}", target, name);
        Ok(InstanceHandle {
            instance_id: target.clone(),
            identity,
            content_hash: String::new(),
            restored_at: Utc::now(),
        })
    }
}

fn parse_container_names(stdout: &str) -> Vec<InstanceId> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(InstanceId::from)
        .collect()
}
