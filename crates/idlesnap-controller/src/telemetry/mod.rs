//! Idle-state residency telemetry
//!
//! Cumulative per-core time-in-state counters are sampled on a fixed
//! interval, independent of the controller. Residency over a window is
//! derived from counter deltas, so counter resets and sampling jitter never
//! produce negative or >100% readings.

mod sysfs;
pub mod turbostat;

pub use sysfs::SysfsResidencySource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Raw counter as reported by the source, before name mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResidency {
    pub core: u32,
    pub state_name: String,
    pub cumulative_time_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidencySample {
    pub core: u32,
    pub sampled_at: DateTime<Utc>,
    /// Canonical state name
    pub state_name: String,
    /// Monotonic but may reset; only ever diffed
    pub cumulative_time_us: u64,
}

#[async_trait]
pub trait ResidencySource: Send + Sync {
    /// Online cores.
    async fn cores(&self) -> anyhow::Result<Vec<u32>>;

    /// Current counters for every idle state of the given cores.
    async fn read(&self, cores: &[u32]) -> anyhow::Result<Vec<RawResidency>>;
}

/// Explicit vendor-name to canonical-name mapping for idle states.
///
/// Unmapped names are dropped rather than guessed from their index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CStateMap {
    aliases: BTreeMap<String, String>,
}

impl Default for CStateMap {
    fn default() -> Self {
        let pairs = [
            ("POLL", "POLL"),
            ("C1", "C1"),
            ("C1E", "C1E"),
            ("C1-HSW", "C1"),
            ("C1E-HSW", "C1E"),
            ("C1-SKX", "C1"),
            ("C1E-SKX", "C1E"),
            ("C3", "C3"),
            ("C3-HSW", "C3"),
            ("C6", "C6"),
            ("C6-HSW", "C6"),
            ("C6-BDW", "C6"),
            ("C6-SKX", "C6"),
            ("C6-SPR", "C6"),
            ("C7", "C7"),
            ("C7s", "C7"),
            ("C7s-HSW", "C7"),
        ];
        Self::from_pairs(pairs)
    }
}

impl CStateMap {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            aliases: pairs
                .into_iter()
                .map(|(raw, canonical)| (raw.into(), canonical.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, raw: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(raw.into(), canonical.into());
    }

    pub fn canonical(&self, raw: &str) -> Option<&str> {
        self.aliases.get(raw.trim()).map(String::as_str)
    }

    pub fn contains_canonical(&self, canonical: &str) -> bool {
        self.aliases.values().any(|name| name == canonical)
    }

    pub fn canonical_states(&self) -> BTreeSet<&str> {
        self.aliases.values().map(String::as_str).collect()
    }
}

/// Residency percentage of `state` over `[start, end]`, averaged across `cores`.
///
/// An empty core set means every core present in the samples. Returns `None`
/// when no sample pair overlaps the window.
pub fn compute_residency(
    samples: &[ResidencySample],
    state: &str,
    cores: &[u32],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<f64> {
    if end <= start {
        return None;
    }

    let cores: BTreeSet<u32> = if cores.is_empty() {
        samples
            .iter()
            .filter(|s| s.state_name == state)
            .map(|s| s.core)
            .collect()
    } else {
        cores.iter().copied().collect()
    };

    let per_core: Vec<f64> = cores
        .into_iter()
        .filter_map(|core| core_residency(samples, state, core, start, end))
        .collect();

    if per_core.is_empty() {
        None
    } else {
        Some(per_core.iter().sum::<f64>() / per_core.len() as f64)
    }
}

fn core_residency(
    samples: &[ResidencySample],
    state: &str,
    core: u32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<f64> {
    let mut series: Vec<&ResidencySample> = samples
        .iter()
        .filter(|s| s.core == core && s.state_name == state)
        .collect();
    series.sort_by_key(|s| s.sampled_at);

    let mut contributed_us = 0.0;
    let mut covered_us = 0.0;

    for pair in series.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        let elapsed_us = micros(next.sampled_at - prev.sampled_at);
        if elapsed_us <= 0.0 {
            continue;
        }

        let overlap_start = prev.sampled_at.max(start);
        let overlap_end = next.sampled_at.min(end);
        if overlap_end <= overlap_start {
            continue;
        }
        let overlap_us = micros(overlap_end - overlap_start);

        // A decreasing counter was reset; count from zero
        let delta = if next.cumulative_time_us >= prev.cumulative_time_us {
            next.cumulative_time_us - prev.cumulative_time_us
        } else {
            next.cumulative_time_us
        };
        let delta_us = (delta as f64).min(elapsed_us);

        contributed_us += delta_us * overlap_us / elapsed_us;
        covered_us += overlap_us;
    }

    (covered_us > 0.0).then(|| contributed_us / covered_us * 100.0)
}

fn micros(span: chrono::Duration) -> f64 {
    span.num_microseconds().unwrap_or(i64::MAX) as f64
}

/// Wall-clock source for sample timestamps and window bounds.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Bounded buffer of residency samples fed by a [`ResidencySource`].
pub struct TelemetryCollector {
    source: Arc<dyn ResidencySource>,
    clock: Clock,
    cstates: CStateMap,
    cores: Vec<u32>,
    capacity: usize,
    samples: RwLock<VecDeque<ResidencySample>>,
    read_failures: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(
        source: Arc<dyn ResidencySource>,
        cstates: CStateMap,
        cores: Vec<u32>,
        capacity: usize,
    ) -> Self {
        Self {
            source,
            clock: Arc::new(Utc::now),
            cstates,
            cores,
            capacity: capacity.max(1),
            samples: RwLock::new(VecDeque::new()),
            read_failures: AtomicU64::new(0),
        }
    }

    /// Sysfs-backed collector for the configured cores.
    pub fn from_config(config: &crate::config::ControllerConfig) -> Self {
        Self::new(
            Arc::new(SysfsResidencySource::new(config.sysfs_root.clone())),
            config.cstate_map.clone(),
            config.cores.clone(),
            config.telemetry_capacity,
        )
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Current time on the collector's clock; window bounds must use it too.
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn cstates(&self) -> &CStateMap {
        &self.cstates
    }

    /// Configured cores, or every online core when none were configured.
    pub async fn cores(&self) -> Vec<u32> {
        if !self.cores.is_empty() {
            return self.cores.clone();
        }
        match self.source.cores().await {
            Ok(cores) => cores,
            Err(e) => {
                warn!(operation = "telemetry_cores", error_kind = "telemetry_read", "Failed to list cores: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Take one sample of every core. Read failures are logged and absorbed.
    pub async fn sample_once(&self) -> usize {
        let cores = self.cores().await;
        let raw = match self.source.read(&cores).await {
            Ok(raw) => raw,
            Err(e) => {
                self.read_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    operation = "telemetry_sample",
                    error_kind = "telemetry_read",
                    "Residency read failed: {:#}",
                    e
                );
                return 0;
            }
        };

        let sampled_at = self.now();
        let mapped: Vec<ResidencySample> = raw
            .into_iter()
            .filter_map(|r| {
                let canonical = self.cstates.canonical(&r.state_name)?;
                Some(ResidencySample {
                    core: r.core,
                    sampled_at,
                    state_name: canonical.to_string(),
                    cumulative_time_us: r.cumulative_time_us,
                })
            })
            .collect();

        let count = mapped.len();
        self.record(mapped).await;
        count
    }

    pub async fn record(&self, samples: impl IntoIterator<Item = ResidencySample>) {
        let mut buffer = self.samples.write().await;
        for sample in samples {
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(sample);
        }
    }

    pub async fn samples(&self) -> Vec<ResidencySample> {
        self.samples.read().await.iter().cloned().collect()
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    pub async fn residency(
        &self,
        state: &str,
        cores: &[u32],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<f64> {
        let samples = self.samples.read().await;
        let (head, tail) = samples.as_slices();
        if tail.is_empty() {
            return compute_residency(head, state, cores, start, end);
        }
        let joined: Vec<ResidencySample> = samples.iter().cloned().collect();
        compute_residency(&joined, state, cores, start, end)
    }

    /// Sample on a fixed interval until shutdown is signalled.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!("Telemetry sampling every {:?}", interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let count = self.sample_once().await;
                        debug!("Recorded {} residency samples", count);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Record per-core residency of `states` to a wide CSV, one row per interval.
///
/// Columns are `timestamp,cpu<N>_<state>_percent,...`.
pub async fn monitor_to_csv(
    collector: &TelemetryCollector,
    states: &[String],
    interval: Duration,
    duration: Duration,
    out: &Path,
) -> anyhow::Result<usize> {
    let cores = collector.cores().await;
    let mut writer = csv::Writer::from_path(out)?;

    let mut header = vec!["timestamp".to_string()];
    for core in &cores {
        for state in states {
            header.push(format!("cpu{}_{}_percent", core, state.to_ascii_lowercase()));
        }
    }
    writer.write_record(&header)?;

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    collector.sample_once().await;
    let mut window_start = collector.now();
    let deadline = tokio::time::Instant::now() + duration;
    let mut rows = 0;

    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        collector.sample_once().await;
        let window_end = collector.now();

        let mut row = vec![window_end.to_rfc3339()];
        for core in &cores {
            for state in states {
                let value = collector
                    .residency(state, &[*core], window_start, window_end)
                    .await
                    .unwrap_or(0.0);
                row.push(format!("{value:.2}"));
            }
        }
        writer.write_record(&row)?;
        writer.flush()?;
        rows += 1;
        window_start = window_end;
    }

    info!("Wrote {} residency rows to {}", rows, out.display());
    Ok(rows)
}
