//! Energy and latency reporting
//!
//! Everything here is a post-hoc batch join of the controller's transition
//! journal and latency records with telemetry samples.

mod report;

pub use report::{
    export_summary, load_baseline, read_results, write_baseline, write_results, ExperimentResults,
    SummaryRow, BASELINE_FILE, RESULTS_FILE,
};

use crate::controller::{LatencyRecord, Operation, TransitionRecord};
use crate::telemetry::{compute_residency, ResidencySample};
use chrono::{DateTime, Utc};
use idlesnap_common::{InstanceId, InstanceState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Whole-server power model used for savings estimates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyModel {
    pub server_power_w: f64,
    /// Fraction of power saved while cores sit in the deep idle state
    pub c6_power_reduction: f64,
}

impl Default for EnergyModel {
    fn default() -> Self {
        Self {
            server_power_w: 100.0,
            c6_power_reduction: 0.85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyEstimate {
    pub overhead_energy_j: f64,
    pub idle_energy_saved_j: f64,
    pub net_savings_j: f64,
    pub net_savings_percent: f64,
    /// Minimum idle time for a positive net saving; `None` without deep idle residency
    pub break_even_idle_s: Option<f64>,
}

impl EnergyModel {
    pub fn estimate(&self, overhead_s: f64, idle_s: f64, residency_pct: f64) -> EnergyEstimate {
        let power = self.server_power_w;
        let fraction = residency_pct / 100.0;

        let overhead_energy_j = power * overhead_s;
        let idle_energy_saved_j = power * self.c6_power_reduction * idle_s * fraction;
        let net_savings_j = idle_energy_saved_j - overhead_energy_j;
        let net_savings_percent = if idle_s > 0.0 && power > 0.0 {
            net_savings_j / (power * idle_s) * 100.0
        } else {
            0.0
        };
        let effective = self.c6_power_reduction * fraction;
        let break_even_idle_s = (effective > 0.0).then(|| overhead_s / effective);

        EnergyEstimate {
            overhead_energy_j,
            idle_energy_saved_j,
            net_savings_j,
            net_savings_percent,
            break_even_idle_s,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub std_dev_ms: f64,
}

impl LatencyStats {
    /// Zero or negative values mark failed operations and are left out.
    pub fn from_millis(values: impl IntoIterator<Item = f64>) -> Self {
        let valid: Vec<f64> = values.into_iter().filter(|v| *v > 0.0).collect();
        if valid.is_empty() {
            return Self::default();
        }
        Self {
            count: valid.len(),
            mean_ms: valid.iter().sum::<f64>() / valid.len() as f64,
            min_ms: valid.iter().copied().fold(f64::INFINITY, f64::min),
            max_ms: valid.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            std_dev_ms: crate::telemetry::turbostat::sample_std_dev(&valid),
        }
    }
}

/// One checkpoint-to-restore episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedInterval {
    pub instance_id: InstanceId,
    pub epoch: u32,
    pub generation: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub residency_pct: Option<f64>,
}

impl SuspendedInterval {
    pub fn idle_duration_s(&self) -> f64 {
        (self.end - self.start)
            .num_microseconds()
            .map_or(0.0, |us| us as f64 / 1_000_000.0)
    }
}

/// Persisted per-run row of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run: u32,
    pub checkpoint_ms: f64,
    pub restore_ms: f64,
    pub idle_duration_s: f64,
    pub c6_residency_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub checkpoint_latency_stats: LatencyStats,
    pub restore_latency_stats: LatencyStats,
    pub avg_residency_pct: f64,
    pub baseline_residency_pct: Option<f64>,
    /// Net savings summed over every episode
    pub estimated_energy_saved_joules: f64,
    /// Estimate for an average episode
    pub energy: EnergyEstimate,
    pub intervals: Vec<SuspendedInterval>,
}

impl EnergyReport {
    pub fn residency_improvement_pct(&self) -> f64 {
        self.avg_residency_pct - self.baseline_residency_pct.unwrap_or(0.0)
    }
}

pub struct MetricsAggregator {
    model: EnergyModel,
    deep_state: String,
    cores: Vec<u32>,
}

impl MetricsAggregator {
    pub fn new(model: EnergyModel, deep_state: impl Into<String>, cores: Vec<u32>) -> Self {
        Self {
            model,
            deep_state: deep_state.into(),
            cores,
        }
    }

    /// Suspended spans from the journal; still-open spans end at `until`.
    pub fn suspended_intervals(
        journal: &[TransitionRecord],
        until: DateTime<Utc>,
    ) -> Vec<SuspendedInterval> {
        let mut open: HashMap<(InstanceId, u32), (DateTime<Utc>, u64)> = HashMap::new();
        let mut intervals = Vec::new();

        for record in journal {
            let key = (record.instance_id.clone(), record.epoch);
            if record.to == InstanceState::Suspended {
                open.insert(key, (record.at, record.generation));
            } else if record.from == InstanceState::Suspended {
                if let Some((start, generation)) = open.remove(&key) {
                    intervals.push(SuspendedInterval {
                        instance_id: key.0,
                        epoch: key.1,
                        generation,
                        start,
                        end: record.at,
                        residency_pct: None,
                    });
                }
            }
        }

        for ((instance_id, epoch), (start, generation)) in open {
            if until > start {
                intervals.push(SuspendedInterval {
                    instance_id,
                    epoch,
                    generation,
                    start,
                    end: until,
                    residency_pct: None,
                });
            }
        }

        intervals.sort_by_key(|i| (i.start, i.instance_id.clone()));
        intervals
    }

    pub fn aggregate(
        &self,
        journal: &[TransitionRecord],
        latencies: &[LatencyRecord],
        samples: &[ResidencySample],
        baseline_residency_pct: Option<f64>,
        until: DateTime<Utc>,
    ) -> EnergyReport {
        let checkpoint_latency_stats = Self::latency_stats(latencies, Operation::Checkpoint);
        let restore_latency_stats = Self::latency_stats(latencies, Operation::Restore);

        let intervals: Vec<SuspendedInterval> = Self::suspended_intervals(journal, until)
            .into_iter()
            .map(|mut interval| {
                interval.residency_pct = compute_residency(
                    samples,
                    &self.deep_state,
                    &self.cores,
                    interval.start,
                    interval.end,
                );
                interval
            })
            .collect();

        let residencies: Vec<f64> = intervals.iter().filter_map(|i| i.residency_pct).collect();
        let avg_residency_pct = crate::telemetry::turbostat::mean(&residencies).unwrap_or(0.0);
        let idle_durations: Vec<f64> = intervals.iter().map(|i| i.idle_duration_s()).collect();
        let avg_idle_s = crate::telemetry::turbostat::mean(&idle_durations).unwrap_or(0.0);

        let overhead_s = (checkpoint_latency_stats.mean_ms + restore_latency_stats.mean_ms) / 1000.0;
        let energy = self.model.estimate(overhead_s, avg_idle_s, avg_residency_pct);
        let estimated_energy_saved_joules = intervals
            .iter()
            .map(|i| {
                self.model
                    .estimate(overhead_s, i.idle_duration_s(), i.residency_pct.unwrap_or(0.0))
                    .net_savings_j
            })
            .sum();

        EnergyReport {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            checkpoint_latency_stats,
            restore_latency_stats,
            avg_residency_pct,
            baseline_residency_pct,
            estimated_energy_saved_joules,
            energy,
            intervals,
        }
    }

    /// One row per suspension episode, joined with its checkpoint and restore latency.
    pub fn run_records(report: &EnergyReport, latencies: &[LatencyRecord]) -> Vec<RunRecord> {
        let latency_ms = |interval: &SuspendedInterval, operation: Operation| {
            latencies
                .iter()
                .find(|l| {
                    l.succeeded
                        && l.operation == operation
                        && l.instance_id == interval.instance_id
                        && l.generation == interval.generation
                })
                .map_or(0.0, |l| l.latency.as_secs_f64() * 1000.0)
        };

        report
            .intervals
            .iter()
            .enumerate()
            .map(|(i, interval)| RunRecord {
                run: i as u32 + 1,
                checkpoint_ms: latency_ms(interval, Operation::Checkpoint),
                restore_ms: latency_ms(interval, Operation::Restore),
                idle_duration_s: interval.idle_duration_s(),
                c6_residency_percent: interval.residency_pct.unwrap_or(0.0),
            })
            .collect()
    }

    fn latency_stats(latencies: &[LatencyRecord], operation: Operation) -> LatencyStats {
        LatencyStats::from_millis(
            latencies
                .iter()
                .filter(|l| l.operation == operation && l.succeeded)
                .map(|l| l.latency.as_secs_f64() * 1000.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(from: InstanceState, to: InstanceState, secs: i64, generation: u64) -> TransitionRecord {
        TransitionRecord {
            instance_id: InstanceId::new("web"),
            epoch: 0,
            from,
            to,
            at: at(secs),
            generation,
        }
    }

    fn latency(operation: Operation, generation: u64, ms: u64, succeeded: bool) -> LatencyRecord {
        LatencyRecord {
            instance_id: InstanceId::new("web"),
            operation,
            generation,
            latency: Duration::from_millis(ms),
            at: at(0),
            succeeded,
        }
    }

    fn c6(secs: i64, cumulative_us: u64) -> ResidencySample {
        ResidencySample {
            core: 0,
            sampled_at: at(secs),
            state_name: "C6".into(),
            cumulative_time_us: cumulative_us,
        }
    }

    #[test]
    fn test_energy_model_matches_reference_numbers() {
        // 500ms overhead, 60s idle, 80% residency
        let estimate = EnergyModel::default().estimate(0.5, 60.0, 80.0);
        assert!((estimate.overhead_energy_j - 50.0).abs() < 1e-9);
        assert!((estimate.idle_energy_saved_j - 4080.0).abs() < 1e-9);
        assert!((estimate.net_savings_j - 4030.0).abs() < 1e-9);
        assert!((estimate.net_savings_percent - 4030.0 / 6000.0 * 100.0).abs() < 1e-9);
        assert!((estimate.break_even_idle_s.unwrap() - 0.5 / 0.68).abs() < 1e-9);

        assert_eq!(EnergyModel::default().estimate(0.5, 60.0, 0.0).break_even_idle_s, None);
    }

    #[test]
    fn test_latency_stats_ignore_failures() {
        let stats = LatencyStats::from_millis([100.0, 0.0, 300.0]);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean_ms, 200.0);
        assert_eq!(stats.min_ms, 100.0);
        assert_eq!(stats.max_ms, 300.0);
        assert_eq!(LatencyStats::from_millis([]), LatencyStats::default());
    }

    #[test]
    fn test_suspended_intervals_from_journal() {
        use InstanceState::*;
        let journal = vec![
            record(Running, Checkpointing, 0, 0),
            record(Checkpointing, Suspended, 1, 1),
            record(Suspended, Restoring, 11, 1),
            record(Restoring, Running, 12, 1),
            record(Running, Checkpointing, 20, 1),
            record(Checkpointing, Suspended, 21, 2),
        ];
        let intervals = MetricsAggregator::suspended_intervals(&journal, at(31));

        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].generation, 1);
        assert_eq!(intervals[0].idle_duration_s(), 10.0);
        // Still suspended: closed at `until`
        assert_eq!(intervals[1].generation, 2);
        assert_eq!(intervals[1].end, at(31));
    }

    #[test]
    fn test_aggregate_joins_residency_and_latency() {
        use InstanceState::*;
        let journal = vec![
            record(Running, Checkpointing, 0, 0),
            record(Checkpointing, Suspended, 1, 1),
            record(Suspended, Restoring, 11, 1),
            record(Restoring, Running, 12, 1),
        ];
        let latencies = vec![
            latency(Operation::Checkpoint, 1, 400, true),
            latency(Operation::Restore, 1, 100, true),
            latency(Operation::Checkpoint, 2, 900, false),
        ];
        // 9 of 10 seconds in C6 during the suspension
        let samples = vec![c6(1, 0), c6(11, 9_000_000)];

        let aggregator = MetricsAggregator::new(EnergyModel::default(), "C6", vec![0]);
        let report = aggregator.aggregate(&journal, &latencies, &samples, Some(20.0), at(20));

        assert_eq!(report.checkpoint_latency_stats.count, 1);
        assert_eq!(report.checkpoint_latency_stats.mean_ms, 400.0);
        assert!((report.avg_residency_pct - 90.0).abs() < 1e-9);
        assert!((report.residency_improvement_pct() - 70.0).abs() < 1e-9);

        // saved = 100 * 0.85 * 10 * 0.9 = 765, overhead = 100 * 0.5 = 50
        assert!((report.estimated_energy_saved_joules - 715.0).abs() < 1e-6);

        let rows = MetricsAggregator::run_records(&report, &latencies);
        assert_eq!(
            rows,
            vec![RunRecord {
                run: 1,
                checkpoint_ms: 400.0,
                restore_ms: 100.0,
                idle_duration_s: 10.0,
                c6_residency_percent: rows[0].c6_residency_percent,
            }]
        );
        assert!((rows[0].c6_residency_percent - 90.0).abs() < 1e-9);
    }
}
