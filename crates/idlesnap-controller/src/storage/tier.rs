use idlesnap_common::StorageTier;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Decides where a checkpoint blob should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Footprints at or above this go to the cold tier
    pub memory_footprint_limit: u64,
    /// Restore SLAs at or above this can afford the cold tier
    pub memory_sla_bound: Duration,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            memory_footprint_limit: 512 * 1024 * 1024,
            memory_sla_bound: Duration::from_secs(2),
        }
    }
}

impl TierPolicy {
    /// Small instances with a tight restore SLA get memory; everything else goes cold.
    pub fn select(&self, footprint_bytes: u64, restore_sla: Duration) -> StorageTier {
        if footprint_bytes < self.memory_footprint_limit && restore_sla < self.memory_sla_bound {
            StorageTier::Memory
        } else {
            StorageTier::Cold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_selection() {
        let policy = TierPolicy {
            memory_footprint_limit: 1000,
            memory_sla_bound: Duration::from_millis(500),
        };

        assert_eq!(policy.select(10, Duration::from_millis(100)), StorageTier::Memory);
        assert_eq!(policy.select(1000, Duration::from_millis(100)), StorageTier::Cold);
        assert_eq!(policy.select(10, Duration::from_millis(500)), StorageTier::Cold);
        assert_eq!(policy.select(5000, Duration::from_secs(5)), StorageTier::Cold);
    }
}
