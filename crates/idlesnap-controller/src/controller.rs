//! Per-instance state machines driving checkpoint and restore

use crate::backend::{CheckpointBackend, CheckpointOptions, RestoreOptions};
use crate::config::ControllerConfig;
use crate::idle::{IdleEvent, IdleMonitor};
use crate::storage::{
    integrity_hash, CheckpointStore, ColdStore, MemoryPoolStore, PoolKey, TierPolicy,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use idlesnap_common::{
    Checkpoint, CheckpointErrorKind, InstanceHandle, InstanceId, InstanceState, RestoreErrorKind,
    Result, SnapshotError, StorageTier,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Controller-side record of a managed instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Highest committed checkpoint generation
    pub generation: u64,
    pub state: InstanceState,
    pub last_activity_at: DateTime<Utc>,
    /// Current checkpoint; always the one for `generation`
    pub checkpoint_ref: Option<Checkpoint>,
    pub footprint_bytes: u64,
    pub restore_sla: Duration,
    /// Set after a memory capacity failure so the next attempt goes cold
    pub prefer_cold_tier: bool,
    /// Bumped on every re-provision; each epoch is a separate state walk
    pub epoch: u32,
}

impl Instance {
    fn new(id: InstanceId, footprint_bytes: u64, restore_sla: Duration) -> Self {
        Self {
            id,
            generation: 0,
            state: InstanceState::INITIAL,
            last_activity_at: Utc::now(),
            checkpoint_ref: None,
            footprint_bytes,
            restore_sla,
            prefer_cold_tier: false,
            epoch: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub instance_id: InstanceId,
    pub epoch: u32,
    pub from: InstanceState,
    pub to: InstanceState,
    pub at: DateTime<Utc>,
    /// Generation after the transition
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Checkpoint,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyRecord {
    pub instance_id: InstanceId,
    pub operation: Operation,
    /// Generation of the checkpoint written or read
    pub generation: u64,
    pub latency: Duration,
    pub at: DateTime<Utc>,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdleDecision {
    Checkpointed { generation: u64 },
    /// Activity arrived after the event was raised
    NoLongerIdle,
    RateTooHigh { rate: f64 },
    /// Not Running, e.g. a checkpoint is already in flight
    Skipped(InstanceState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    Committed(Checkpoint),
    Skipped(InstanceState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    Restored(InstanceHandle),
    AlreadyRunning,
}

/// What the state watch publishes; readable without the slot lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub generation: u64,
    pub epoch: u32,
}

impl InstanceStatus {
    fn of(instance: &Instance) -> Self {
        Self {
            state: instance.state,
            generation: instance.generation,
            epoch: instance.epoch,
        }
    }
}

struct InstanceSlot {
    instance: Mutex<Instance>,
    status_tx: watch::Sender<InstanceStatus>,
}

/// Owns every instance state machine.
///
/// The Checkpointing/Restoring state is the in-flight marker: it is set under
/// the slot lock before any backend call, so concurrent triggers for the same
/// instance observe it and back off. Backend calls themselves run without the
/// lock held.
pub struct SnapshotController {
    config: ControllerConfig,
    tier_policy: TierPolicy,
    backend: Arc<dyn CheckpointBackend>,
    store: Arc<CheckpointStore>,
    monitor: Arc<IdleMonitor>,
    instances: DashMap<InstanceId, Arc<InstanceSlot>>,
    journal: RwLock<Vec<TransitionRecord>>,
    latencies: RwLock<Vec<LatencyRecord>>,
}

impl SnapshotController {
    pub fn new(
        config: ControllerConfig,
        backend: Arc<dyn CheckpointBackend>,
        store: Arc<CheckpointStore>,
    ) -> Self {
        let monitor = Arc::new(IdleMonitor::new(config.idle_threshold(), config.rate_window()));
        Self {
            tier_policy: config.tier_policy(),
            config,
            backend,
            store,
            monitor,
            instances: DashMap::new(),
            journal: RwLock::new(Vec::new()),
            latencies: RwLock::new(Vec::new()),
        }
    }

    /// Build the storage tiers described by the config.
    pub async fn from_config(
        config: ControllerConfig,
        backend: Arc<dyn CheckpointBackend>,
    ) -> Result<Self> {
        let pool = MemoryPoolStore::new(config.pool_capacity_bytes, config.eviction_policy)
            .with_ttl(config.checkpoint_ttl());
        let cold = match &config.cold_dir {
            Some(dir) => Some(ColdStore::new(dir).await?),
            None => None,
        };
        let store = Arc::new(CheckpointStore::new(Arc::new(pool), cold));
        Ok(Self::new(config, backend, store))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CheckpointBackend> {
        &self.backend
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<IdleMonitor> {
        &self.monitor
    }

    /// Start managing an instance in Running.
    pub fn register(&self, id: InstanceId, footprint_bytes: u64, restore_sla: Duration) -> Result<()> {
        match self.instances.entry(id.clone()) {
            Entry::Occupied(_) => Err(SnapshotError::Internal(format!("{id} is already registered"))),
            Entry::Vacant(vacant) => {
                let instance = Instance::new(id.clone(), footprint_bytes, restore_sla);
                let (status_tx, _) = watch::channel(InstanceStatus::of(&instance));
                vacant.insert(Arc::new(InstanceSlot {
                    instance: Mutex::new(instance),
                    status_tx,
                }));
                self.monitor.track(&id, Instant::now());
                info!(instance = %id, footprint_bytes, "Registered instance");
                Ok(())
            }
        }
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn state(&self, id: &InstanceId) -> Option<InstanceState> {
        self.status(id).map(|status| status.state)
    }

    /// Latest published state, generation and epoch.
    pub fn status(&self, id: &InstanceId) -> Option<InstanceStatus> {
        self.instances.get(id).map(|slot| *slot.status_tx.borrow())
    }

    pub async fn instance(&self, id: &InstanceId) -> Option<Instance> {
        let slot = self.slot(id).ok()?;
        let instance = slot.instance.lock().await;
        Some(instance.clone())
    }

    /// Watch an instance's status.
    pub fn subscribe(&self, id: &InstanceId) -> Option<watch::Receiver<InstanceStatus>> {
        self.instances.get(id).map(|slot| slot.status_tx.subscribe())
    }

    pub async fn journal(&self) -> Vec<TransitionRecord> {
        self.journal.read().await.clone()
    }

    pub async fn latencies(&self) -> Vec<LatencyRecord> {
        self.latencies.read().await.clone()
    }

    /// A request to the instance completed.
    pub async fn record_activity(&self, id: &InstanceId) -> Result<()> {
        let slot = self.slot(id)?;
        self.monitor.record_activity(id);
        slot.instance.lock().await.last_activity_at = Utc::now();
        Ok(())
    }

    /// Checkpoint if the instance is idle long enough and below the rate threshold.
    #[instrument(skip(self, event), fields(instance = %event.instance_id))]
    pub async fn handle_idle_event(&self, event: IdleEvent) -> Result<IdleDecision> {
        let id = &event.instance_id;
        self.slot(id)?;
        self.monitor.consume(id);

        let still_idle = self.monitor.last_activity(id) == Some(event.idle_since);
        if !still_idle || event.idle_duration <= self.config.idle_threshold() {
            return Ok(IdleDecision::NoLongerIdle);
        }

        let rate = self.monitor.request_rate(id, Instant::now());
        if rate >= self.config.rate_threshold {
            debug!(rate, "Idle but request rate above threshold");
            return Ok(IdleDecision::RateTooHigh { rate });
        }

        match self.checkpoint_now(id).await? {
            CheckpointOutcome::Committed(checkpoint) => Ok(IdleDecision::Checkpointed {
                generation: checkpoint.generation,
            }),
            CheckpointOutcome::Skipped(state) => Ok(IdleDecision::Skipped(state)),
        }
    }

    /// Checkpoint and park a Running instance.
    ///
    /// Anything other than Running is reported as skipped, which makes
    /// repeated or concurrent triggers idempotent.
    #[instrument(skip(self), fields(instance = %id))]
    pub async fn checkpoint_now(&self, id: &InstanceId) -> Result<CheckpointOutcome> {
        let slot = self.slot(id)?;

        let (tier, generation) = {
            let mut instance = slot.instance.lock().await;
            if instance.state != InstanceState::Running {
                debug!(state = %instance.state, "Checkpoint skipped");
                return Ok(CheckpointOutcome::Skipped(instance.state));
            }
            self.transition(&slot, &mut instance, InstanceState::Checkpointing)
                .await?;

            let mut tier = if instance.prefer_cold_tier {
                StorageTier::Cold
            } else {
                self.tier_policy
                    .select(instance.footprint_bytes, instance.restore_sla)
            };
            if tier == StorageTier::Cold && !self.store.has_cold_tier() {
                tier = StorageTier::Memory;
            }
            (tier, instance.generation + 1)
        };

        let started = Instant::now();
        let result = self.perform_checkpoint(id, tier, generation).await;
        let latency = started.elapsed();

        let mut instance = slot.instance.lock().await;
        match result {
            Ok(checkpoint) => {
                let superseded = instance.checkpoint_ref.replace(checkpoint.clone());
                instance.generation = generation;
                instance.prefer_cold_tier = false;
                self.transition(&slot, &mut instance, InstanceState::Suspended)
                    .await?;
                drop(instance);

                if let Some(old) = superseded {
                    self.store.unpin(&old.storage_ref).await;
                }
                self.monitor.pause(id);
                self.record_latency(id, Operation::Checkpoint, generation, latency, true)
                    .await;

                info!(
                    generation,
                    size_bytes = checkpoint.size_bytes,
                    tier = %checkpoint.storage_ref.tier,
                    latency_ms = latency.as_millis() as u64,
                    "Instance checkpointed and suspended"
                );
                Ok(CheckpointOutcome::Committed(checkpoint))
            }
            Err(err) => {
                if matches!(err, SnapshotError::StorageCapacity { .. }) {
                    instance.prefer_cold_tier = true;
                }
                self.transition(&slot, &mut instance, InstanceState::Running)
                    .await?;
                drop(instance);

                self.monitor.rearm(id);
                self.record_latency(id, Operation::Checkpoint, generation, latency, false)
                    .await;

                error!(
                    instance = %id,
                    operation = "checkpoint",
                    error_kind = err.kind(),
                    "Checkpoint failed, instance stays running: {}",
                    err
                );
                Err(err)
            }
        }
    }

    /// Dump, store pinned and stop. Nothing is left behind on failure.
    async fn perform_checkpoint(
        &self,
        id: &InstanceId,
        tier: StorageTier,
        generation: u64,
    ) -> Result<Checkpoint> {
        let limit = self.config.checkpoint_timeout();
        let options = CheckpointOptions {
            leave_running: true,
            timeout: limit,
        };

        let blob = match tokio::time::timeout(limit, self.backend.checkpoint(id, &options)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SnapshotError::checkpoint(
                    id,
                    CheckpointErrorKind::Timeout,
                    format!("checkpoint exceeded {:?}", limit),
                ))
            }
        };

        let integrity_hash = integrity_hash(&blob);
        let size_bytes = blob.len() as u64;
        let blob: Arc<[u8]> = Arc::from(blob);
        let key = PoolKey::new(id.clone(), generation);

        let storage_ref = match self.store.put_pinned(tier, key.clone(), blob.clone()).await {
            Ok(storage_ref) => storage_ref,
            Err(SnapshotError::StorageCapacity { requested, available })
                if tier == StorageTier::Memory && self.store.has_cold_tier() =>
            {
                warn!(
                    requested,
                    available, "Memory pool full, falling back to the cold tier"
                );
                self.store.put_pinned(StorageTier::Cold, key, blob).await?
            }
            Err(err) => return Err(err),
        };

        let stopped = match tokio::time::timeout(limit, self.backend.stop(id)).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::checkpoint(
                id,
                CheckpointErrorKind::Timeout,
                "stopping the instance timed out",
            )),
        };
        if let Err(err) = stopped {
            self.store.remove(&storage_ref).await;
            return Err(match err {
                SnapshotError::Checkpoint { .. } => err,
                other => SnapshotError::checkpoint(id, CheckpointErrorKind::Busy, other.to_string()),
            });
        }

        Ok(Checkpoint {
            instance_id: id.clone(),
            generation,
            created_at: Utc::now(),
            size_bytes,
            storage_ref,
            integrity_hash,
            ttl: self.config.checkpoint_ttl(),
        })
    }

    /// Bring a Suspended instance back from its current checkpoint.
    #[instrument(skip(self), fields(instance = %id))]
    pub async fn restore(&self, id: &InstanceId) -> Result<RestoreOutcome> {
        let slot = self.slot(id)?;

        let checkpoint = {
            let mut instance = slot.instance.lock().await;
            match instance.state {
                InstanceState::Running => return Ok(RestoreOutcome::AlreadyRunning),
                InstanceState::Failed => return Err(SnapshotError::InstanceFailed(id.clone())),
                InstanceState::Suspended => {}
                other => {
                    return Err(SnapshotError::InvalidTransition {
                        instance: id.clone(),
                        from: other,
                        to: InstanceState::Restoring,
                    })
                }
            }
            self.transition(&slot, &mut instance, InstanceState::Restoring)
                .await?;
            instance.checkpoint_ref.clone()
        };

        let started = Instant::now();
        let result = match &checkpoint {
            Some(checkpoint) => self.perform_restore(id, checkpoint).await,
            None => Err(SnapshotError::restore(
                id,
                RestoreErrorKind::NotFound,
                "suspended without a checkpoint",
            )),
        };
        let latency = started.elapsed();
        let generation = checkpoint.as_ref().map(|c| c.generation).unwrap_or_default();

        let mut instance = slot.instance.lock().await;
        match result {
            Ok(handle) => {
                instance.last_activity_at = Utc::now();
                self.transition(&slot, &mut instance, InstanceState::Running)
                    .await?;
                drop(instance);

                if let Some(checkpoint) = &checkpoint {
                    self.store.unpin(&checkpoint.storage_ref).await;
                }
                self.monitor.rearm(id);
                self.record_latency(id, Operation::Restore, generation, latency, true)
                    .await;

                info!(
                    generation,
                    identity = %handle.identity,
                    latency_ms = latency.as_millis() as u64,
                    "Instance restored"
                );
                Ok(RestoreOutcome::Restored(handle))
            }
            Err(err) => {
                self.transition(&slot, &mut instance, InstanceState::Failed)
                    .await?;
                drop(instance);

                self.record_latency(id, Operation::Restore, generation, latency, false)
                    .await;

                error!(
                    instance = %id,
                    operation = "restore",
                    error_kind = err.kind(),
                    "Restore failed, instance needs re-provisioning: {}",
                    err
                );
                Err(err)
            }
        }
    }

    /// Fetch, verify and restore, retrying recoverable failures on the same blob.
    async fn perform_restore(&self, id: &InstanceId, checkpoint: &Checkpoint) -> Result<InstanceHandle> {
        let blob = self.store.get(&checkpoint.storage_ref).await.map_err(|err| match err {
            SnapshotError::BlobNotFound(blob) => SnapshotError::restore(
                id,
                RestoreErrorKind::NotFound,
                format!("checkpoint blob {blob} is gone"),
            ),
            other => SnapshotError::restore(id, RestoreErrorKind::Corrupt, other.to_string()),
        })?;

        if integrity_hash(&blob) != checkpoint.integrity_hash {
            return Err(SnapshotError::restore(
                id,
                RestoreErrorKind::Corrupt,
                "checkpoint blob failed integrity verification",
            ));
        }

        let limit = self.config.restore_timeout();
        let options = RestoreOptions {
            target_identity: id.clone(),
            timeout: limit,
        };
        let attempts = self.config.restore_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(limit, self.backend.restore(&blob, &options)).await {
                Ok(result) => result,
                Err(_) => Err(SnapshotError::restore(
                    id,
                    RestoreErrorKind::Timeout,
                    format!("restore exceeded {:?}", limit),
                )),
            };

            match result {
                Ok(handle) if handle.content_hash != checkpoint.integrity_hash => {
                    return Err(SnapshotError::restore(
                        id,
                        RestoreErrorKind::Corrupt,
                        "restored instance does not match the checkpoint",
                    ));
                }
                Ok(handle) => return Ok(handle),
                Err(SnapshotError::Restore { kind, message, .. })
                    if kind.is_recoverable() && attempt < attempts =>
                {
                    warn!(
                        instance = %id,
                        operation = "restore",
                        error_kind = %kind,
                        attempt,
                        "Recoverable restore failure, retrying: {}",
                        message
                    );
                    tokio::time::sleep(self.config.restore_backoff() * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Replace a Failed instance with a fresh Running record.
    #[instrument(skip(self), fields(instance = %id))]
    pub async fn reprovision(&self, id: &InstanceId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut instance = slot.instance.lock().await;
        if instance.state != InstanceState::Failed {
            return Err(SnapshotError::InvalidTransition {
                instance: id.clone(),
                from: instance.state,
                to: InstanceState::Running,
            });
        }

        if let Some(checkpoint) = instance.checkpoint_ref.take() {
            self.store.unpin(&checkpoint.storage_ref).await;
            self.store.remove(&checkpoint.storage_ref).await;
        }
        instance.state = InstanceState::INITIAL;
        instance.epoch += 1;
        instance.prefer_cold_tier = false;
        instance.last_activity_at = Utc::now();
        slot.status_tx.send_replace(InstanceStatus::of(&instance));
        drop(instance);

        self.monitor.track(id, Instant::now());
        info!("Instance re-provisioned");
        Ok(())
    }

    /// One pass: expire stale blobs, then handle every pending idle event concurrently.
    pub async fn sweep(&self) -> Vec<(InstanceId, Result<IdleDecision>)> {
        let now = Instant::now();

        let expired = self.store.pool().purge_expired(now).await;
        if !expired.is_empty() {
            debug!("Purged {} expired checkpoint blobs", expired.len());
        }

        let events = self.monitor.poll(now);
        join_all(events.into_iter().map(|event| async move {
            let id = event.instance_id.clone();
            let decision = self.handle_idle_event(event).await;
            (id, decision)
        }))
        .await
    }

    /// Sweep on a fixed interval until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Snapshot controller running (idle threshold {:?}, rate threshold {} req/s)",
            self.config.idle_threshold(),
            self.config.rate_threshold
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (id, decision) in self.sweep().await {
                        if let Ok(IdleDecision::Checkpointed { generation }) = decision {
                            debug!(instance = %id, generation, "Sweep checkpointed instance");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Snapshot controller shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn slot(&self, id: &InstanceId) -> Result<Arc<InstanceSlot>> {
        self.instances
            .get(id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| SnapshotError::UnknownInstance(id.clone()))
    }

    async fn transition(
        &self,
        slot: &InstanceSlot,
        instance: &mut Instance,
        to: InstanceState,
    ) -> Result<()> {
        let from = instance.state;
        if !from.can_transition_to(to) {
            return Err(SnapshotError::InvalidTransition {
                instance: instance.id.clone(),
                from,
                to,
            });
        }

        instance.state = to;
        self.journal.write().await.push(TransitionRecord {
            instance_id: instance.id.clone(),
            epoch: instance.epoch,
            from,
            to,
            at: Utc::now(),
            generation: instance.generation,
        });
        slot.status_tx.send_replace(InstanceStatus::of(instance));
        debug!(instance = %instance.id, %from, %to, "State transition");
        Ok(())
    }

    async fn record_latency(
        &self,
        id: &InstanceId,
        operation: Operation,
        generation: u64,
        latency: Duration,
        succeeded: bool,
    ) {
        self.latencies.write().await.push(LatencyRecord {
            instance_id: id.clone(),
            operation,
            generation,
            latency,
            at: Utc::now(),
            succeeded,
        });
    }
}
