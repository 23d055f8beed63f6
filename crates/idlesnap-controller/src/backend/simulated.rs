//! In-process backend with scripted latencies and failures
//!
//! Used by the scenario tests and for dry runs of the controller on hosts
//! without CRIU.

use super::{BackendKind, CheckpointBackend, CheckpointOptions, RestoreOptions};
use crate::storage::integrity_hash;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use idlesnap_common::{
    CheckpointErrorKind, InstanceHandle, InstanceId, RestoreErrorKind, Result, SnapshotError,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const BLOB_MAGIC: &[u8] = b"IDLESNAP-SIM\n";
const DEFAULT_FOOTPRINT: usize = 4096;

/// Outcome of the next scripted call; an empty script always succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedStep<K> {
    Succeed,
    Fail(K),
    /// Never returns; the caller's timeout decides
    Hang,
}

#[derive(Debug)]
struct SimInstance {
    running: bool,
    footprint: usize,
    generation: u64,
}

pub struct SimulatedBackend {
    instances: Mutex<HashMap<InstanceId, SimInstance>>,
    checkpoint_latency: Duration,
    restore_latency: Duration,
    checkpoint_script: Mutex<VecDeque<SimulatedStep<CheckpointErrorKind>>>,
    restore_script: Mutex<VecDeque<SimulatedStep<RestoreErrorKind>>>,
    checkpoint_calls: AtomicUsize,
    restore_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    in_flight: Arc<DashMap<InstanceId, usize>>,
    max_in_flight: Arc<AtomicUsize>,
}

/// Tracks concurrent backend calls per instance, released on drop so a
/// cancelled (timed out) call is still accounted for.
struct InFlightGuard {
    instance: InstanceId,
    in_flight: Arc<DashMap<InstanceId, usize>>,
}

impl InFlightGuard {
    fn enter(backend: &SimulatedBackend, instance: &InstanceId) -> Self {
        let current = {
            let mut count = backend.in_flight.entry(instance.clone()).or_insert(0);
            *count += 1;
            *count
        };
        backend.max_in_flight.fetch_max(current, Ordering::SeqCst);
        Self {
            instance: instance.clone(),
            in_flight: backend.in_flight.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.in_flight.get_mut(&self.instance) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            checkpoint_latency: Duration::from_millis(150),
            restore_latency: Duration::from_millis(90),
            checkpoint_script: Mutex::new(VecDeque::new()),
            restore_script: Mutex::new(VecDeque::new()),
            checkpoint_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            in_flight: Arc::new(DashMap::new()),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_latencies(mut self, checkpoint: Duration, restore: Duration) -> Self {
        self.checkpoint_latency = checkpoint;
        self.restore_latency = restore;
        self
    }

    /// Register a running instance with a simulated memory footprint.
    pub async fn add_instance(&self, instance: impl Into<InstanceId>, footprint: usize) {
        self.instances.lock().await.insert(
            instance.into(),
            SimInstance {
                running: true,
                footprint,
                generation: 0,
            },
        );
    }

    pub async fn script_checkpoints(&self, steps: impl IntoIterator<Item = SimulatedStep<CheckpointErrorKind>>) {
        self.checkpoint_script.lock().await.extend(steps);
    }

    pub async fn script_restores(&self, steps: impl IntoIterator<Item = SimulatedStep<RestoreErrorKind>>) {
        self.restore_script.lock().await.extend(steps);
    }

    pub async fn is_running(&self, instance: &InstanceId) -> bool {
        self.instances
            .lock()
            .await
            .get(instance)
            .is_some_and(|i| i.running)
    }

    pub fn checkpoint_calls(&self) -> usize {
        self.checkpoint_calls.load(Ordering::SeqCst)
    }

    pub fn restore_calls(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls seen for any single instance.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn encode_blob(instance: &InstanceId, generation: u64, footprint: usize) -> Vec<u8> {
        let header = format!("{instance}\n{generation}\n");
        let mut blob = Vec::with_capacity(BLOB_MAGIC.len() + header.len() + footprint);
        blob.extend_from_slice(BLOB_MAGIC);
        blob.extend_from_slice(header.as_bytes());
        let seed = instance.as_str().as_bytes();
        blob.extend((0..footprint).map(|i| {
            let byte = seed.get(i % seed.len().max(1)).copied().unwrap_or(0);
            byte.wrapping_add((i as u64).wrapping_add(generation) as u8)
        }));
        blob
    }

    /// Source instance, generation and footprint named by a blob's header.
    fn decode_blob(blob: &[u8]) -> Option<(InstanceId, u64, usize)> {
        let rest = blob.strip_prefix(BLOB_MAGIC)?;
        let mut parts = rest.splitn(3, |b| *b == b'\n');
        let instance = std::str::from_utf8(parts.next()?).ok()?;
        let generation = std::str::from_utf8(parts.next()?).ok()?.parse::<u64>().ok()?;
        let state = parts.next()?;
        Some((InstanceId::new(instance), generation, state.len()))
    }
}

#[async_trait]
impl CheckpointBackend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn check_prerequisites(&self) -> Result<()> {
        Ok(())
    }

    async fn checkpoint(&self, instance: &InstanceId, _options: &CheckpointOptions) -> Result<Vec<u8>> {
        self.checkpoint_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard::enter(self, instance);

        let step = self
            .checkpoint_script
            .lock()
            .await
            .pop_front()
            .unwrap_or(SimulatedStep::Succeed);

        tokio::time::sleep(self.checkpoint_latency).await;

        match step {
            SimulatedStep::Succeed => {}
            SimulatedStep::Fail(kind) => {
                return Err(SnapshotError::checkpoint(instance, kind, "scripted failure"));
            }
            SimulatedStep::Hang => std::future::pending::<()>().await,
        }

        let mut instances = self.instances.lock().await;
        let sim = instances.entry(instance.clone()).or_insert(SimInstance {
            running: true,
            footprint: DEFAULT_FOOTPRINT,
            generation: 0,
        });
        if !sim.running {
            return Err(SnapshotError::checkpoint(
                instance,
                CheckpointErrorKind::Unsupported,
                "instance is not running",
            ));
        }
        sim.generation += 1;

        debug!("Simulated checkpoint of {} (generation {})", instance, sim.generation);
        Ok(Self::encode_blob(instance, sim.generation, sim.footprint))
    }

    async fn restore(&self, blob: &[u8], options: &RestoreOptions) -> Result<InstanceHandle> {
        let target = &options.target_identity;
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard::enter(self, target);

        let step = self
            .restore_script
            .lock()
            .await
            .pop_front()
            .unwrap_or(SimulatedStep::Succeed);

        tokio::time::sleep(self.restore_latency).await;

        match step {
            SimulatedStep::Succeed => {}
            SimulatedStep::Fail(kind) => {
                return Err(SnapshotError::restore(target, kind, "scripted failure"));
            }
            SimulatedStep::Hang => std::future::pending::<()>().await,
        }

        let (source, generation, footprint) = Self::decode_blob(blob).ok_or_else(|| {
            SnapshotError::restore(target, RestoreErrorKind::Corrupt, "unrecognised blob format")
        })?;

        let mut instances = self.instances.lock().await;
        let sim = instances.entry(target.clone()).or_insert(SimInstance {
            running: false,
            footprint,
            generation: 0,
        });
        if sim.running {
            return Err(SnapshotError::restore(
                target,
                RestoreErrorKind::Conflict,
                "an instance with this identity is already running",
            ));
        }
        sim.running = true;
        sim.footprint = footprint;

        // The restored memory is regenerated from the header, not copied from the blob
        let restored = Self::encode_blob(&source, generation, footprint);
        Ok(InstanceHandle {
            instance_id: target.clone(),
            identity: format!("sim-{}", target),
            content_hash: integrity_hash(&restored),
            restored_at: Utc::now(),
        })
    }

    async fn list(&self) -> Result<Vec<InstanceId>> {
        let mut ids: Vec<InstanceId> = self.instances.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn stop(&self, instance: &InstanceId) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        match self.instances.lock().await.get_mut(instance) {
            Some(sim) => {
                sim.running = false;
                Ok(())
            }
            None => Err(SnapshotError::checkpoint(
                instance,
                CheckpointErrorKind::Busy,
                "no such instance",
            )),
        }
    }

    async fn dump_named(
        &self,
        instance: &InstanceId,
        dir: &Path,
        name: &str,
        options: &CheckpointOptions,
    ) -> Result<()> {
        let blob = self.checkpoint(instance, options).await?;
        if !options.leave_running {
            self.stop(instance).await?;
        }
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(name), blob).await?;
        Ok(())
    }

    async fn restore_named(
        &self,
        name: &str,
        dir: &Path,
        options: &RestoreOptions,
    ) -> Result<InstanceHandle> {
        let blob = tokio::fs::read(dir.join(name)).await.map_err(|e| {
            SnapshotError::restore(&options.target_identity, RestoreErrorKind::NotFound, e.to_string())
        })?;
        self.restore(&blob, options).await
    }
}
