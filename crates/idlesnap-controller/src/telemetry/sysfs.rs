//! Linux cpuidle counters: `<root>/cpu<N>/cpuidle/state<K>/{name,time}`

use super::{RawResidency, ResidencySource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct SysfsResidencySource {
    root: PathBuf,
}

impl SysfsResidencySource {
    /// `root` is normally `/sys/devices/system/cpu`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_core(&self, core: u32) -> Result<Vec<RawResidency>> {
        let cpuidle = self.root.join(format!("cpu{core}")).join("cpuidle");
        let mut entries = fs::read_dir(&cpuidle)
            .await
            .with_context(|| format!("cpuidle not available at {}", cpuidle.display()))?;

        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(dir_name) = file_name.to_str() else {
                continue;
            };
            if parse_indexed(dir_name, "state").is_none() {
                continue;
            }
            states.push(read_state(core, &entry.path()).await?);
        }
        Ok(states)
    }
}

async fn read_state(core: u32, dir: &Path) -> Result<RawResidency> {
    let name = fs::read_to_string(dir.join("name"))
        .await
        .with_context(|| format!("Failed to read {}/name", dir.display()))?;
    let time = fs::read_to_string(dir.join("time"))
        .await
        .with_context(|| format!("Failed to read {}/time", dir.display()))?;

    Ok(RawResidency {
        core,
        state_name: name.trim().to_string(),
        cumulative_time_us: time
            .trim()
            .parse()
            .with_context(|| format!("Malformed residency counter in {}", dir.display()))?,
    })
}

/// `cpu12` -> 12 for prefix `cpu`; `cpufreq` and friends are rejected.
fn parse_indexed(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

#[async_trait]
impl ResidencySource for SysfsResidencySource {
    async fn cores(&self) -> Result<Vec<u32>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list {}", self.root.display()))?;

        let mut cores = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(core) = entry.file_name().to_str().and_then(|n| parse_indexed(n, "cpu")) {
                cores.push(core);
            }
        }
        cores.sort_unstable();
        Ok(cores)
    }

    async fn read(&self, cores: &[u32]) -> Result<Vec<RawResidency>> {
        let mut all = Vec::new();
        for core in cores {
            all.extend(self.read_core(*core).await?);
        }
        Ok(all)
    }
}
