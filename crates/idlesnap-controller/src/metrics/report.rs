//! Persisted experiment results and their summary

use super::{EnergyEstimate, EnergyModel, RunRecord};
use crate::telemetry::turbostat::mean;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

pub const RESULTS_FILE: &str = "results.csv";
pub const BASELINE_FILE: &str = "baseline_c6.csv";

pub fn write_results(path: &Path, runs: &[RunRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for run in runs {
        writer.serialize(run)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_results(path: &Path) -> Result<Vec<RunRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut runs = Vec::new();
    for row in reader.deserialize() {
        runs.push(row.with_context(|| format!("Malformed row in {}", path.display()))?);
    }
    Ok(runs)
}

/// Single-column residency log for the no-controller baseline.
pub fn write_baseline(path: &Path, residency_pct: &[f64]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["sample", "c6_percent"])?;
    for (i, value) in residency_pct.iter().enumerate() {
        writer.write_record([i.to_string(), value.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Mean of every column whose header mentions `c6_percent`; `None` when the file is absent.
pub fn load_baseline(path: &Path) -> Result<Option<f64>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let columns: Vec<usize> = reader
        .headers()?
        .iter()
        .enumerate()
        .filter(|(_, name)| name.contains("c6_percent"))
        .map(|(i, _)| i)
        .collect();

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        values.extend(
            columns
                .iter()
                .filter_map(|i| record.get(*i))
                .filter_map(|field| field.trim().parse::<f64>().ok()),
        );
    }
    Ok(mean(&values))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentResults {
    pub runs: Vec<RunRecord>,
    pub baseline_c6: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub metric: String,
    pub value: f64,
    pub unit: String,
}

impl SummaryRow {
    fn new(metric: &str, value: f64, unit: &str) -> Self {
        Self {
            metric: metric.to_string(),
            value,
            unit: unit.to_string(),
        }
    }
}

impl ExperimentResults {
    pub fn load(dir: &Path) -> Result<Self> {
        let results = dir.join(RESULTS_FILE);
        anyhow::ensure!(results.exists(), "No {} in {}", RESULTS_FILE, dir.display());
        Ok(Self {
            runs: read_results(&results)?,
            baseline_c6: load_baseline(&dir.join(BASELINE_FILE))?,
        })
    }

    pub fn avg_checkpoint_ms(&self) -> f64 {
        positive_mean(self.runs.iter().map(|r| r.checkpoint_ms))
    }

    pub fn avg_restore_ms(&self) -> f64 {
        positive_mean(self.runs.iter().map(|r| r.restore_ms))
    }

    pub fn avg_c6_residency(&self) -> f64 {
        let values: Vec<f64> = self.runs.iter().map(|r| r.c6_residency_percent).collect();
        mean(&values).unwrap_or(0.0)
    }

    /// Idle period the experiment was configured with
    pub fn idle_duration_s(&self) -> f64 {
        self.runs.first().map_or(0.0, |r| r.idle_duration_s)
    }

    pub fn total_overhead_ms(&self) -> f64 {
        self.avg_checkpoint_ms() + self.avg_restore_ms()
    }

    pub fn c6_improvement(&self) -> f64 {
        self.avg_c6_residency() - self.baseline_c6.unwrap_or(0.0)
    }

    pub fn energy(&self, model: &EnergyModel) -> EnergyEstimate {
        model.estimate(
            self.total_overhead_ms() / 1000.0,
            self.idle_duration_s(),
            self.avg_c6_residency(),
        )
    }

    pub fn summary_rows(&self, model: &EnergyModel) -> Vec<SummaryRow> {
        let energy = self.energy(model);
        vec![
            SummaryRow::new("num_runs", self.runs.len() as f64, "count"),
            SummaryRow::new("avg_checkpoint_ms", self.avg_checkpoint_ms(), "ms"),
            SummaryRow::new("avg_restore_ms", self.avg_restore_ms(), "ms"),
            SummaryRow::new("total_overhead_ms", self.total_overhead_ms(), "ms"),
            SummaryRow::new("avg_c6_residency", self.avg_c6_residency(), "%"),
            SummaryRow::new("baseline_c6_residency", self.baseline_c6.unwrap_or(0.0), "%"),
            SummaryRow::new("c6_improvement", self.c6_improvement(), "%"),
            SummaryRow::new("overhead_energy", energy.overhead_energy_j, "J"),
            SummaryRow::new("idle_energy_saved", energy.idle_energy_saved_j, "J"),
            SummaryRow::new("net_savings", energy.net_savings_j, "J"),
            SummaryRow::new("net_savings_percent", energy.net_savings_percent, "%"),
            SummaryRow::new(
                "break_even_idle",
                energy.break_even_idle_s.unwrap_or(f64::INFINITY),
                "s",
            ),
        ]
    }
}

pub fn export_summary(results: &ExperimentResults, model: &EnergyModel, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in results.summary_rows(model) {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn positive_mean(values: impl Iterator<Item = f64>) -> f64 {
    let valid: Vec<f64> = values.filter(|v| *v > 0.0).collect();
    mean(&valid).unwrap_or(0.0)
}
