//! Real CRIU round trip; needs root and a working `criu check`

use anyhow::Result;
use idlesnap_common::InstanceId;
use idlesnap_controller::backend::{CheckpointBackend, CheckpointOptions, CriuBackend, RestoreOptions};
use idlesnap_controller::config::CriuSettings;
use idlesnap_controller::storage::integrity_hash;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;

#[cfg_attr(
    not(feature = "checkpoint-tests"),
    ignore = "requires CRIU and root"
)]
#[tokio::test]
async fn criu_checkpoint_stop_restore_round_trip() -> Result<()> {
    let workdir = TempDir::new()?;
    let settings = CriuSettings {
        images_dir: workdir.path().join("images"),
        log_dir: Some(workdir.path().join("logs")),
        tcp_established: false,
        ..CriuSettings::default()
    };
    let backend = CriuBackend::new(settings).await?;
    backend.check_prerequisites().await?;

    let child = tokio::process::Command::new("setsid")
        .arg("sleep")
        .arg("300")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    let pid = child.id().expect("spawned child has a pid");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let id = InstanceId::new(pid.to_string());

    let blob = backend
        .checkpoint(
            &id,
            &CheckpointOptions {
                leave_running: false,
                timeout: Duration::from_secs(30),
            },
        )
        .await?;
    assert!(!blob.is_empty());

    let handle = backend
        .restore(
            &blob,
            &RestoreOptions {
                target_identity: id.clone(),
                timeout: Duration::from_secs(30),
            },
        )
        .await?;
    assert_eq!(handle.content_hash, integrity_hash(&blob));

    backend.stop(&id).await?;
    Ok(())
}
