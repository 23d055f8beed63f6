//! Shared fixtures for the controller scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use idlesnap_common::{
    first_illegal_step, InboundRequest, InstanceId, InstanceResponse, InstanceState, Result,
};
use idlesnap_controller::backend::{BackendKind, SimulatedBackend};
use idlesnap_controller::controller::TransitionRecord;
use idlesnap_controller::{ControllerConfig, InstanceTransport, SnapshotController};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const FOOTPRINT: usize = 4096;

/// 500ms idle threshold, 10 req/s rate threshold, 2s operation timeouts.
pub fn scenario_config() -> ControllerConfig {
    ControllerConfig {
        backend: BackendKind::Simulated,
        idle_threshold_ms: 500,
        rate_threshold: 10.0,
        checkpoint_timeout_ms: 2_000,
        restore_timeout_ms: 2_000,
        ..ControllerConfig::default()
    }
}

pub struct Harness {
    pub backend: Arc<SimulatedBackend>,
    pub controller: Arc<SnapshotController>,
}

impl Harness {
    pub async fn new(config: ControllerConfig) -> anyhow::Result<Self> {
        let backend = Arc::new(SimulatedBackend::new());
        let controller = Arc::new(SnapshotController::from_config(config, backend.clone()).await?);
        Ok(Self {
            backend,
            controller,
        })
    }

    /// Launch an instance in the backend and hand it to the controller.
    pub async fn launch(&self, id: &str) -> anyhow::Result<InstanceId> {
        let id = InstanceId::new(id);
        self.backend.add_instance(id.clone(), FOOTPRINT).await;
        self.controller
            .register(id.clone(), FOOTPRINT as u64, Duration::from_secs(1))?;
        Ok(id)
    }
}

/// Every epoch of every instance must be a walk on the state graph.
pub fn assert_journal_is_walk(journal: &[TransitionRecord]) {
    let mut walks: BTreeMap<(InstanceId, u32), Vec<InstanceState>> = BTreeMap::new();
    for record in journal {
        let walk = walks
            .entry((record.instance_id.clone(), record.epoch))
            .or_insert_with(|| vec![record.from]);
        assert_eq!(
            walk.last(),
            Some(&record.from),
            "journal for {} skips a state",
            record.instance_id
        );
        walk.push(record.to);
    }
    for ((id, epoch), walk) in walks {
        assert_eq!(
            first_illegal_step(walk.iter().copied()),
            None,
            "{id} epoch {epoch} walked {walk:?}"
        );
    }
}

/// Echoes payloads back and remembers delivery order.
#[derive(Default)]
pub struct RecordingTransport {
    pub delivered: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTransport {
    pub async fn delivered(&self) -> Vec<Vec<u8>> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl InstanceTransport for RecordingTransport {
    async fn forward(&self, request: InboundRequest) -> Result<InstanceResponse> {
        self.delivered.lock().await.push(request.payload.clone());
        Ok(InstanceResponse {
            request_id: request.request_id,
            payload: request.payload,
        })
    }
}
