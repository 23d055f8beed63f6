//! Repeated checkpoint, idle, restore cycles for one instance

use crate::controller::{CheckpointOutcome, LatencyRecord, Operation, SnapshotController};
use crate::metrics::{
    write_baseline, write_results, EnergyReport, ExperimentResults, MetricsAggregator, RunRecord,
    BASELINE_FILE, RESULTS_FILE,
};
use crate::telemetry::TelemetryCollector;
use anyhow::{Context, Result};
use chrono::Utc;
use idlesnap_common::{InstanceId, InstanceState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub instance: InstanceId,
    pub num_runs: u32,
    /// How long each cycle keeps the instance suspended
    pub idle: Duration,
    pub results_dir: PathBuf,
    pub footprint_bytes: u64,
    pub restore_sla: Duration,
    /// Measure residency with the instance left running before the first cycle
    pub baseline: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub runs: Vec<RunRecord>,
    pub report: EnergyReport,
    pub results: ExperimentResults,
}

pub struct ExperimentRunner {
    controller: Arc<SnapshotController>,
    telemetry: Arc<TelemetryCollector>,
}

impl ExperimentRunner {
    pub fn new(controller: Arc<SnapshotController>, telemetry: Arc<TelemetryCollector>) -> Self {
        Self {
            controller,
            telemetry,
        }
    }

    pub async fn run(&self, experiment: &ExperimentConfig) -> Result<ExperimentOutcome> {
        let id = &experiment.instance;
        tokio::fs::create_dir_all(&experiment.results_dir)
            .await
            .with_context(|| format!("Failed to create {}", experiment.results_dir.display()))?;

        if self.controller.state(id).is_none() {
            self.controller
                .register(id.clone(), experiment.footprint_bytes, experiment.restore_sla)?;
        }

        let config = self.controller.config();
        let deep_state = config.deep_idle_state.clone();
        let cores = self.telemetry.cores().await;

        let baseline = match experiment.baseline {
            Some(window) => Some(self.measure_baseline(experiment, &deep_state, &cores, window).await?),
            None => None,
        };

        info!(
            instance = %id,
            runs = experiment.num_runs,
            idle_s = experiment.idle.as_secs_f64(),
            "Starting experiment"
        );

        let mut runs = Vec::with_capacity(experiment.num_runs as usize);
        for run in 1..=experiment.num_runs {
            let record = self.cycle(id, run, experiment.idle, &deep_state, &cores).await;
            info!(
                instance = %id,
                run,
                checkpoint_ms = record.checkpoint_ms,
                restore_ms = record.restore_ms,
                c6_residency_percent = record.c6_residency_percent,
                "Run complete"
            );
            runs.push(record);
        }

        let results_path = experiment.results_dir.join(RESULTS_FILE);
        write_results(&results_path, &runs)?;
        info!("Results written to {}", results_path.display());

        let aggregator = MetricsAggregator::new(config.energy, deep_state, cores);
        let report = aggregator.aggregate(
            &self.controller.journal().await,
            &self.controller.latencies().await,
            &self.telemetry.samples().await,
            baseline,
            Utc::now(),
        );

        Ok(ExperimentOutcome {
            results: ExperimentResults {
                runs: runs.clone(),
                baseline_c6: baseline,
            },
            runs,
            report,
        })
    }

    /// One cycle. Failed operations are recorded as zero latency.
    async fn cycle(
        &self,
        id: &InstanceId,
        run: u32,
        idle: Duration,
        deep_state: &str,
        cores: &[u32],
    ) -> RunRecord {
        let mut record = RunRecord {
            run,
            checkpoint_ms: 0.0,
            restore_ms: 0.0,
            idle_duration_s: 0.0,
            c6_residency_percent: 0.0,
        };

        let checkpoint = match self.controller.checkpoint_now(id).await {
            Ok(CheckpointOutcome::Committed(checkpoint)) => checkpoint,
            Ok(CheckpointOutcome::Skipped(state)) => {
                warn!(instance = %id, run, %state, "Instance not running, skipping cycle");
                self.recover(id).await;
                return record;
            }
            Err(err) => {
                error!(
                    instance = %id,
                    operation = "checkpoint",
                    error_kind = err.kind(),
                    run,
                    "Checkpoint failed: {}",
                    err
                );
                return record;
            }
        };
        record.checkpoint_ms =
            latency_ms(&self.controller.latencies().await, id, Operation::Checkpoint, checkpoint.generation);

        self.telemetry.sample_once().await;
        let idle_start = self.telemetry.now();
        tokio::time::sleep(idle).await;
        self.telemetry.sample_once().await;
        let idle_end = self.telemetry.now();

        record.idle_duration_s = idle.as_secs_f64();
        record.c6_residency_percent = self
            .telemetry
            .residency(deep_state, cores, idle_start, idle_end)
            .await
            .unwrap_or(0.0);

        match self.controller.restore(id).await {
            Ok(_) => {
                record.restore_ms = latency_ms(
                    &self.controller.latencies().await,
                    id,
                    Operation::Restore,
                    checkpoint.generation,
                );
            }
            Err(err) => {
                error!(
                    instance = %id,
                    operation = "restore",
                    error_kind = err.kind(),
                    run,
                    "Restore failed: {}",
                    err
                );
                self.recover(id).await;
            }
        }
        record
    }

    async fn recover(&self, id: &InstanceId) {
        if self.controller.state(id) != Some(InstanceState::Failed) {
            return;
        }
        if let Err(err) = self.controller.reprovision(id).await {
            error!(
                instance = %id,
                operation = "reprovision",
                error_kind = err.kind(),
                "Re-provisioning failed: {}",
                err
            );
        }
    }

    async fn measure_baseline(
        &self,
        experiment: &ExperimentConfig,
        deep_state: &str,
        cores: &[u32],
        window: Duration,
    ) -> Result<f64> {
        info!("Measuring baseline residency for {:?}", window);
        self.telemetry.sample_once().await;
        let start = self.telemetry.now();
        tokio::time::sleep(window).await;
        self.telemetry.sample_once().await;
        let end = self.telemetry.now();

        let mut per_core = Vec::with_capacity(cores.len());
        for core in cores {
            if let Some(pct) = self.telemetry.residency(deep_state, &[*core], start, end).await {
                per_core.push(pct);
            }
        }
        write_baseline(&experiment.results_dir.join(BASELINE_FILE), &per_core)?;

        let baseline = crate::telemetry::turbostat::mean(&per_core).unwrap_or(0.0);
        info!(baseline_pct = baseline, "Baseline residency measured");
        Ok(baseline)
    }
}

fn latency_ms(latencies: &[LatencyRecord], id: &InstanceId, operation: Operation, generation: u64) -> f64 {
    latencies
        .iter()
        .rev()
        .find(|l| l.succeeded && l.operation == operation && &l.instance_id == id && l.generation == generation)
        .map_or(0.0, |l| l.latency.as_secs_f64() * 1000.0)
}
