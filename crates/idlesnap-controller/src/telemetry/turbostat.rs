//! Offline parsing of turbostat logs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurbostatSample {
    pub cpu: u32,
    pub avg_mhz: f64,
    pub busy_percent: f64,
    pub bzy_mhz: f64,
    pub c1_percent: f64,
    pub c6_percent: f64,
    pub c7_percent: f64,
    pub pkg_watt: Option<f64>,
    pub core_watt: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuStats {
    pub samples: usize,
    pub c6_avg: f64,
    pub c6_min: f64,
    pub c6_max: f64,
    pub busy_avg: f64,
    /// Mean of non-zero frequency readings
    pub freq_avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStats {
    pub c6_avg: f64,
    /// Sample standard deviation, 0 with fewer than two samples
    pub c6_std: f64,
    pub busy_avg: f64,
    pub pkg_watt_avg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurbostatSummary {
    pub total_samples: usize,
    pub per_cpu: BTreeMap<u32, CpuStats>,
    pub aggregate: AggregateStats,
}

pub fn parse_file(path: &Path) -> Result<Vec<TurbostatSample>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read turbostat log {}", path.display()))?;
    Ok(parse(&content))
}

/// Parse every section of a turbostat log.
///
/// A section starts at a header line naming both `Core` and `CPU`; columns are
/// located by header name. Package summary rows (`CPU` of `-`) and rows that
/// do not parse are skipped.
pub fn parse(content: &str) -> Vec<TurbostatSample> {
    let mut samples = Vec::new();
    let mut columns: Option<HashMap<String, usize>> = None;
    let mut width = 0;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.contains(&"Core") && fields.contains(&"CPU") {
            width = fields.len();
            columns = Some(
                fields
                    .iter()
                    .enumerate()
                    .map(|(i, name)| (name.to_ascii_lowercase(), i))
                    .collect(),
            );
            continue;
        }

        let Some(columns) = &columns else {
            continue;
        };
        if line.starts_with('-') || fields.len() < width {
            continue;
        }
        if let Some(sample) = parse_row(columns, &fields) {
            samples.push(sample);
        }
    }

    samples
}

fn parse_row(columns: &HashMap<String, usize>, fields: &[&str]) -> Option<TurbostatSample> {
    let cpu_field = fields.get(*columns.get("cpu")?)?;
    if *cpu_field == "-" {
        return None;
    }
    let cpu = cpu_field.parse().ok()?;

    // Missing columns default to zero, present but unparsable ones reject the row
    let value = |name: &str| -> Option<f64> {
        match columns.get(name) {
            Some(&i) => fields.get(i)?.parse().ok(),
            None => Some(0.0),
        }
    };
    let optional = |name: &str| -> Option<Option<f64>> {
        match columns.get(name) {
            Some(&i) => fields.get(i)?.parse().ok().map(Some),
            None => Some(None),
        }
    };

    Some(TurbostatSample {
        cpu,
        avg_mhz: value("avg_mhz")?,
        busy_percent: value("busy%")?,
        bzy_mhz: value("bzy_mhz")?,
        c1_percent: value("c1%")?,
        c6_percent: value("c6%")?,
        c7_percent: value("c7%")?,
        pkg_watt: optional("pkgwatt")?,
        // turbostat spells it CorWatt; some builds print CoreWatt
        core_watt: if columns.contains_key("corwatt") {
            optional("corwatt")?
        } else {
            optional("corewatt")?
        },
    })
}

/// Per-CPU and aggregate statistics, optionally restricted to some CPUs.
pub fn analyze(samples: &[TurbostatSample], cpu_filter: Option<&[u32]>) -> Option<TurbostatSummary> {
    let selected: Vec<&TurbostatSample> = samples
        .iter()
        .filter(|s| cpu_filter.map_or(true, |cpus| cpus.contains(&s.cpu)))
        .collect();
    if selected.is_empty() {
        return None;
    }

    let mut by_cpu: BTreeMap<u32, Vec<&TurbostatSample>> = BTreeMap::new();
    for sample in &selected {
        by_cpu.entry(sample.cpu).or_default().push(sample);
    }

    let per_cpu = by_cpu
        .into_iter()
        .map(|(cpu, cpu_samples)| {
            let c6: Vec<f64> = cpu_samples.iter().map(|s| s.c6_percent).collect();
            let busy: Vec<f64> = cpu_samples.iter().map(|s| s.busy_percent).collect();
            let freq: Vec<f64> = cpu_samples
                .iter()
                .map(|s| s.avg_mhz)
                .filter(|mhz| *mhz > 0.0)
                .collect();
            let stats = CpuStats {
                samples: cpu_samples.len(),
                c6_avg: mean(&c6).unwrap_or(0.0),
                c6_min: c6.iter().copied().fold(f64::INFINITY, f64::min),
                c6_max: c6.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                busy_avg: mean(&busy).unwrap_or(0.0),
                freq_avg: mean(&freq).unwrap_or(0.0),
            };
            (cpu, stats)
        })
        .collect();

    let c6: Vec<f64> = selected.iter().map(|s| s.c6_percent).collect();
    let busy: Vec<f64> = selected.iter().map(|s| s.busy_percent).collect();
    let pkg: Vec<f64> = selected.iter().filter_map(|s| s.pkg_watt).collect();

    Some(TurbostatSummary {
        total_samples: selected.len(),
        per_cpu,
        aggregate: AggregateStats {
            c6_avg: mean(&c6).unwrap_or(0.0),
            c6_std: sample_std_dev(&c6),
            busy_avg: mean(&busy).unwrap_or(0.0),
            pkg_watt_avg: mean(&pkg),
        },
    })
}

pub fn export_csv(samples: &[TurbostatSample], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for sample in samples {
        writer.serialize(sample)?;
    }
    writer.flush()?;
    Ok(())
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

pub(crate) fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
Core\tCPU\tAvg_MHz\tBusy%\tBzy_MHz\tC1%\tC6%\tPkgWatt\tCorWatt
-\t-\t20\t1.00\t2000\t5.00\t90.00\t12.50\t3.00
0\t0\t30\t1.50\t2000\t4.00\t80.00\t12.50\t3.00
1\t1\t0\t0.50\t0\t2.00\t96.00\t\t
Core\tCPU\tAvg_MHz\tBusy%\tBzy_MHz\tC1%\tC6%\tPkgWatt\tCorWatt
-\t-\t22\t1.10\t2000\t5.00\t88.00\t13.50\t3.10
0\t0\t40\t2.00\t2000\t3.00\t70.00\t13.50\t3.10
1\t1\tbogus\t0.50\t0\t2.00\t95.00\t13.50\t3.10
";

    #[test]
    fn test_parse_sections_and_skip_summary_rows() {
        let samples = parse(LOG);
        // Two CPU-0 rows; the short CPU-1 row and the bogus one are dropped
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.cpu == 0));
        assert_eq!(samples[0].c6_percent, 80.0);
        assert_eq!(samples[0].pkg_watt, Some(12.5));
        assert_eq!(samples[1].core_watt, Some(3.1));
        assert_eq!(samples[0].c7_percent, 0.0);
    }

    #[test]
    fn test_columns_found_by_name() {
        let log = "CPU Core C6% Busy%\n3 1 55.5 4.0\n";
        let samples = parse(log);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].cpu, 3);
        assert_eq!(samples[0].c6_percent, 55.5);
        assert_eq!(samples[0].busy_percent, 4.0);
        assert_eq!(samples[0].pkg_watt, None);
    }

    #[test]
    fn test_analyze_with_filter() {
        let log = "Core CPU Avg_MHz Busy% C6% PkgWatt\n\
                   0 0 100 2.0 80.0 10.0\n\
                   1 1 0 1.0 90.0 10.0\n\
                   0 0 300 4.0 60.0 12.0\n";
        let samples = parse(log);
        let summary = analyze(&samples, None).unwrap();
        assert_eq!(summary.total_samples, 3);
        let cpu0 = &summary.per_cpu[&0];
        assert_eq!(cpu0.c6_avg, 70.0);
        assert_eq!(cpu0.c6_min, 60.0);
        assert_eq!(cpu0.c6_max, 80.0);
        assert_eq!(cpu0.freq_avg, 200.0);
        assert_eq!(summary.per_cpu[&1].freq_avg, 0.0);
        assert!((summary.aggregate.c6_std - 15.275252316519467).abs() < 1e-9);
        assert!((summary.aggregate.pkg_watt_avg.unwrap() - 32.0 / 3.0).abs() < 1e-9);

        let only_one = analyze(&samples, Some(&[1])).unwrap();
        assert_eq!(only_one.total_samples, 1);
        assert!(analyze(&samples, Some(&[9])).is_none());
    }

    #[test]
    fn test_export_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.csv");
        export_csv(&parse("Core CPU C6%\n0 0 42.0\n"), &path).unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.starts_with("cpu,avg_mhz,busy_percent"));
        assert!(written.contains("42.0"));
    }
}
