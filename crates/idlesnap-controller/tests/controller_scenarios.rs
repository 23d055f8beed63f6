//! Controller state machine scenarios against the simulated backend

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{assert_journal_is_walk, scenario_config, Harness, FOOTPRINT};
use futures::future::join_all;
use idlesnap_common::{
    CheckpointErrorKind, InstanceHandle, InstanceId, InstanceState, RestoreErrorKind,
    SnapshotError, StorageTier,
};
use idlesnap_controller::backend::{
    BackendKind, CheckpointOptions, RestoreOptions, SimulatedBackend, SimulatedStep,
};
use idlesnap_controller::controller::Operation;
use idlesnap_controller::idle::IdleEvent;
use idlesnap_controller::{
    CheckpointBackend, CheckpointOutcome, ControllerConfig, IdleDecision, RestoreOutcome,
    SnapshotController,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

/// Always restores the first image it was handed, like a runtime reading a
/// stale images directory.
struct StaleImageBackend {
    inner: Arc<SimulatedBackend>,
    first_image: Mutex<Option<Vec<u8>>>,
}

#[async_trait]
impl CheckpointBackend for StaleImageBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn check_prerequisites(&self) -> idlesnap_common::Result<()> {
        self.inner.check_prerequisites().await
    }

    async fn checkpoint(
        &self,
        instance: &InstanceId,
        options: &CheckpointOptions,
    ) -> idlesnap_common::Result<Vec<u8>> {
        self.inner.checkpoint(instance, options).await
    }

    async fn restore(
        &self,
        blob: &[u8],
        options: &RestoreOptions,
    ) -> idlesnap_common::Result<InstanceHandle> {
        let image = self
            .first_image
            .lock()
            .await
            .get_or_insert_with(|| blob.to_vec())
            .clone();
        self.inner.restore(&image, options).await
    }

    async fn list(&self) -> idlesnap_common::Result<Vec<InstanceId>> {
        self.inner.list().await
    }

    async fn stop(&self, instance: &InstanceId) -> idlesnap_common::Result<()> {
        self.inner.stop(instance).await
    }

    async fn dump_named(
        &self,
        instance: &InstanceId,
        dir: &Path,
        name: &str,
        options: &CheckpointOptions,
    ) -> idlesnap_common::Result<()> {
        self.inner.dump_named(instance, dir, name, options).await
    }

    async fn restore_named(
        &self,
        name: &str,
        dir: &Path,
        options: &RestoreOptions,
    ) -> idlesnap_common::Result<InstanceHandle> {
        self.inner.restore_named(name, dir, options).await
    }
}

#[tokio::test(start_paused = true)]
async fn idle_instance_is_checkpointed_and_suspended() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;

    tokio::time::advance(Duration::from_millis(600)).await;
    let decisions = harness.controller.sweep().await;

    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].0, id);
    assert_eq!(
        decisions[0].1.as_ref().ok(),
        Some(&IdleDecision::Checkpointed { generation: 1 })
    );

    let instance = harness.controller.instance(&id).await.expect("registered");
    assert_eq!(instance.state, InstanceState::Suspended);
    assert_eq!(instance.generation, 1);
    assert!(!harness.backend.is_running(&id).await);

    let latencies = harness.controller.latencies().await;
    assert_eq!(latencies.len(), 1);
    assert_eq!(latencies[0].operation, Operation::Checkpoint);
    assert_eq!(latencies[0].latency, Duration::from_millis(150));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn instance_under_threshold_is_left_alone() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;

    tokio::time::advance(Duration::from_millis(400)).await;
    assert!(harness.controller.sweep().await.is_empty());
    assert_eq!(harness.controller.state(&id), Some(InstanceState::Running));
    assert_eq!(harness.backend.checkpoint_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn busy_instance_is_not_checkpointed() -> Result<()> {
    let config = ControllerConfig {
        rate_threshold: 0.5,
        ..scenario_config()
    };
    let harness = Harness::new(config).await?;
    let id = harness.launch("web").await?;

    // 20 requests, then quiet for 600ms: idle, but still 2 req/s over the window
    for _ in 0..20 {
        harness.controller.record_activity(&id).await?;
    }
    tokio::time::advance(Duration::from_millis(600)).await;
    let decisions = harness.controller.sweep().await;

    assert!(matches!(
        decisions[0].1,
        Ok(IdleDecision::RateTooHigh { .. })
    ));
    assert_eq!(harness.controller.state(&id), Some(InstanceState::Running));
    assert_eq!(harness.backend.checkpoint_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn checkpoint_timeout_reverts_to_running() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;
    harness
        .backend
        .script_checkpoints([SimulatedStep::Hang])
        .await;

    let err = harness.controller.checkpoint_now(&id).await.unwrap_err();

    assert!(matches!(
        err,
        SnapshotError::Checkpoint {
            kind: CheckpointErrorKind::Timeout,
            ..
        }
    ));
    let instance = harness.controller.instance(&id).await.expect("registered");
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.generation, 0);
    assert!(instance.checkpoint_ref.is_none());
    assert!(harness.backend.is_running(&id).await);
    assert_eq!(harness.controller.store().pool().stats().await.entries, 0);

    // The next idle window gets another attempt
    tokio::time::advance(Duration::from_millis(600)).await;
    let decisions = harness.controller.sweep().await;
    assert_eq!(
        decisions[0].1.as_ref().ok(),
        Some(&IdleDecision::Checkpointed { generation: 1 })
    );
    assert_journal_is_walk(&harness.controller.journal().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pool_capacity_failure_keeps_instance_running() -> Result<()> {
    let config = ControllerConfig {
        pool_capacity_bytes: 1024,
        ..scenario_config()
    };
    let harness = Harness::new(config).await?;
    let id = harness.launch("web").await?;

    let err = harness.controller.checkpoint_now(&id).await.unwrap_err();

    assert!(matches!(err, SnapshotError::StorageCapacity { .. }));
    let instance = harness.controller.instance(&id).await.expect("registered");
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.generation, 0);
    assert!(instance.prefer_cold_tier);
    assert!(harness.backend.is_running(&id).await);
    assert_eq!(harness.backend.stop_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pool_capacity_falls_back_to_cold_tier() -> Result<()> {
    let cold = TempDir::new()?;
    let config = ControllerConfig {
        pool_capacity_bytes: 1024,
        cold_dir: Some(cold.path().to_path_buf()),
        ..scenario_config()
    };
    let harness = Harness::new(config).await?;
    let id = harness.launch("web").await?;

    let CheckpointOutcome::Committed(checkpoint) = harness.controller.checkpoint_now(&id).await?
    else {
        panic!("checkpoint was skipped");
    };
    assert_eq!(checkpoint.storage_ref.tier, StorageTier::Cold);

    let RestoreOutcome::Restored(handle) = harness.controller.restore(&id).await? else {
        panic!("instance was already running");
    };
    assert_eq!(handle.content_hash, checkpoint.integrity_hash);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pinned_checkpoint_survives_pool_pressure() -> Result<()> {
    let config = ControllerConfig {
        pool_capacity_bytes: 6_000,
        ..scenario_config()
    };
    let harness = Harness::new(config).await?;
    let first = harness.launch("first").await?;
    let second = harness.launch("second").await?;

    harness.controller.checkpoint_now(&first).await?;
    let err = harness.controller.checkpoint_now(&second).await.unwrap_err();
    assert!(matches!(err, SnapshotError::StorageCapacity { .. }));
    assert_eq!(harness.controller.state(&second), Some(InstanceState::Running));

    // The suspended instance's checkpoint was not evicted to make room
    assert!(matches!(
        harness.controller.restore(&first).await?,
        RestoreOutcome::Restored(_)
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duplicate_idle_triggers_checkpoint_once() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;

    tokio::time::advance(Duration::from_millis(600)).await;
    let idle_since = harness
        .controller
        .monitor()
        .last_activity(&id)
        .expect("tracked");
    let event = IdleEvent {
        instance_id: id.clone(),
        idle_since,
        idle_duration: Duration::from_millis(600),
    };

    let (a, b) = tokio::join!(
        harness.controller.handle_idle_event(event.clone()),
        harness.controller.handle_idle_event(event),
    );
    let mut decisions = vec![a?, b?];
    decisions.sort_by_key(|d| !matches!(d, IdleDecision::Checkpointed { .. }));

    assert_eq!(decisions[0], IdleDecision::Checkpointed { generation: 1 });
    assert_eq!(
        decisions[1],
        IdleDecision::Skipped(InstanceState::Checkpointing)
    );
    assert_eq!(harness.backend.checkpoint_calls(), 1);

    // A later sweep sees nothing while suspended
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(harness.controller.sweep().await.is_empty());
    assert_eq!(harness.controller.instance(&id).await.map(|i| i.generation), Some(1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stale_idle_event_is_ignored() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;

    tokio::time::advance(Duration::from_millis(600)).await;
    let events = harness.controller.monitor().poll(tokio::time::Instant::now());
    assert_eq!(events.len(), 1);

    harness.controller.record_activity(&id).await?;
    let decision = harness
        .controller
        .handle_idle_event(events.into_iter().next().expect("one event"))
        .await?;
    assert_eq!(decision, IdleDecision::NoLongerIdle);
    assert_eq!(harness.backend.checkpoint_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_never_overlap_backend_calls() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;

    for _ in 0..3 {
        let checkpoints = join_all((0..8).map(|_| harness.controller.checkpoint_now(&id))).await;
        let committed = checkpoints
            .iter()
            .filter(|r| matches!(r, Ok(CheckpointOutcome::Committed(_))))
            .count();
        assert_eq!(committed, 1);

        let restores = join_all((0..8).map(|_| harness.controller.restore(&id))).await;
        let restored = restores
            .iter()
            .filter(|r| matches!(r, Ok(RestoreOutcome::Restored(_))))
            .count();
        assert_eq!(restored, 1);
        // The losers saw the in-flight Restoring state
        assert!(restores.iter().all(|r| match r {
            Ok(_) => true,
            Err(SnapshotError::InvalidTransition { from, .. }) => *from == InstanceState::Restoring,
            Err(_) => false,
        }));
    }

    assert_eq!(harness.backend.checkpoint_calls(), 3);
    assert_eq!(harness.backend.restore_calls(), 3);
    assert_eq!(harness.backend.max_concurrent_calls(), 1);
    assert_journal_is_walk(&harness.controller.journal().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restored_instance_matches_its_checkpoint() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;

    for generation in 1..=3u64 {
        let CheckpointOutcome::Committed(checkpoint) = harness.controller.checkpoint_now(&id).await?
        else {
            panic!("checkpoint was skipped");
        };
        assert_eq!(checkpoint.generation, generation);

        let RestoreOutcome::Restored(handle) = harness.controller.restore(&id).await? else {
            panic!("instance was already running");
        };
        assert_eq!(handle.content_hash, checkpoint.integrity_hash);
    }

    // Restored checkpoints are unpinned and superseded ones may be evicted
    let stats = harness.controller.store().pool().stats().await;
    assert_eq!(stats.pinned, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restoring_different_state_fails_the_instance() -> Result<()> {
    let simulated = Arc::new(SimulatedBackend::new());
    let backend = Arc::new(StaleImageBackend {
        inner: simulated.clone(),
        first_image: Mutex::new(None),
    });
    let controller = SnapshotController::from_config(scenario_config(), backend).await?;
    let id = InstanceId::new("web");
    simulated.add_instance(id.clone(), FOOTPRINT).await;
    controller.register(id.clone(), FOOTPRINT as u64, Duration::from_secs(1))?;

    controller.checkpoint_now(&id).await?;
    assert!(matches!(controller.restore(&id).await?, RestoreOutcome::Restored(_)));

    // Generation 2 is stored intact, but generation 1 is what comes back
    controller.checkpoint_now(&id).await?;
    let err = controller.restore(&id).await.unwrap_err();
    assert_eq!(err.kind(), "restore_corrupt");
    assert_eq!(controller.state(&id), Some(InstanceState::Failed));
    assert_eq!(simulated.restore_calls(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn recoverable_restore_failure_is_retried() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;
    harness.controller.checkpoint_now(&id).await?;
    harness
        .backend
        .script_restores([
            SimulatedStep::Fail(RestoreErrorKind::Busy),
            SimulatedStep::Hang,
        ])
        .await;

    let outcome = harness.controller.restore(&id).await?;

    assert!(matches!(outcome, RestoreOutcome::Restored(_)));
    assert_eq!(harness.backend.restore_calls(), 3);
    assert_eq!(harness.controller.state(&id), Some(InstanceState::Running));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_restore_attempts_fail_the_instance() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;
    harness.controller.checkpoint_now(&id).await?;
    harness
        .backend
        .script_restores([
            SimulatedStep::Fail(RestoreErrorKind::Busy),
            SimulatedStep::Fail(RestoreErrorKind::Busy),
            SimulatedStep::Fail(RestoreErrorKind::Busy),
        ])
        .await;

    let err = harness.controller.restore(&id).await.unwrap_err();

    assert_eq!(err.kind(), "restore_busy");
    assert_eq!(harness.backend.restore_calls(), 3);
    assert_eq!(harness.controller.state(&id), Some(InstanceState::Failed));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn corrupt_restore_fails_then_reprovision_starts_new_epoch() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;
    harness.controller.checkpoint_now(&id).await?;
    harness
        .backend
        .script_restores([SimulatedStep::Fail(RestoreErrorKind::Corrupt)])
        .await;

    let err = harness.controller.restore(&id).await.unwrap_err();
    assert_eq!(err.kind(), "restore_corrupt");
    // Fatal kinds are not retried
    assert_eq!(harness.backend.restore_calls(), 1);
    assert_eq!(harness.controller.state(&id), Some(InstanceState::Failed));
    assert!(matches!(
        harness.controller.restore(&id).await,
        Err(SnapshotError::InstanceFailed(_))
    ));
    assert!(matches!(
        harness.controller.checkpoint_now(&id).await?,
        CheckpointOutcome::Skipped(InstanceState::Failed)
    ));

    harness.controller.reprovision(&id).await?;
    let instance = harness.controller.instance(&id).await.expect("registered");
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.epoch, 1);
    assert!(instance.checkpoint_ref.is_none());
    assert_eq!(harness.controller.store().pool().stats().await.entries, 0);

    // Failed -> Running is not an edge; the journal restarts per epoch
    assert_journal_is_walk(&harness.controller.journal().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restore_of_running_instance_is_a_no_op() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;

    assert_eq!(
        harness.controller.restore(&id).await?,
        RestoreOutcome::AlreadyRunning
    );
    assert_eq!(harness.backend.restore_calls(), 0);
    assert!(harness.controller.reprovision(&id).await.is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_shutdown() -> Result<()> {
    let harness = Harness::new(scenario_config()).await?;
    let id = harness.launch("web").await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let controller = harness.controller.clone();
    let task = tokio::spawn(async move { controller.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.controller.state(&id), Some(InstanceState::Suspended));

    shutdown_tx.send(true)?;
    task.await?;
    Ok(())
}
