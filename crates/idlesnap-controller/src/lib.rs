//! Energy-aware snapshot controller
//!
//! Checkpoints idle instances through a pluggable [`backend::CheckpointBackend`],
//! parks their blobs in a pooled memory tier (or a compressed cold tier),
//! wakes them on demand through the [`wake_gate::WakeGate`], and correlates
//! suspended time with deep idle-state residency.

pub use idlesnap_common as common;

pub mod backend;
pub mod config;
pub mod controller;
pub mod experiment;
pub mod idle;
pub mod metrics;
pub mod storage;
pub mod telemetry;
pub mod wake_gate;

pub use backend::{build_backend, BackendKind, CheckpointBackend};
pub use config::ControllerConfig;
pub use controller::{
    CheckpointOutcome, IdleDecision, InstanceStatus, RestoreOutcome, SnapshotController,
};
pub use experiment::{ExperimentConfig, ExperimentRunner};
pub use idle::IdleMonitor;
pub use metrics::{EnergyModel, EnergyReport, MetricsAggregator};
pub use storage::{CheckpointStore, MemoryPoolStore};
pub use telemetry::TelemetryCollector;
pub use wake_gate::{GateConfig, InstanceTransport, WakeGate};
