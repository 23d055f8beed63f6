use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identity of a managed service instance (container name, pid, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Where a checkpoint blob lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Pooled memory, fastest restore path
    Memory,
    /// Local disk, compressed
    Cold,
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTier::Memory => f.write_str("memory"),
            StorageTier::Cold => f.write_str("cold"),
        }
    }
}

/// Opaque reference to a stored checkpoint blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub tier: StorageTier,
    pub key: String,
}

impl BlobRef {
    pub fn new(tier: StorageTier, key: impl Into<String>) -> Self {
        Self {
            tier,
            key: key.into(),
        }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.tier, self.key)
    }
}

/// A committed checkpoint of one instance generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instance_id: InstanceId,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub storage_ref: BlobRef,
    /// SHA-256 of the blob, lowercase hex
    pub integrity_hash: String,
    pub ttl: Duration,
}

impl Checkpoint {
    /// `None` when the ttl is too large to represent, i.e. never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

/// Handle to an instance reconstructed by a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub instance_id: InstanceId,
    /// Runtime identity of the restored process (container id, pid)
    pub identity: String,
    /// SHA-256 of the blob the instance was rebuilt from
    pub content_hash: String,
    pub restored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRequest {
    pub request_id: Uuid,
    pub instance_id: InstanceId,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundRequest {
    pub fn new(instance_id: impl Into<InstanceId>, payload: Vec<u8>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            instance_id: instance_id.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceResponse {
    pub request_id: Uuid,
    pub payload: Vec<u8>,
}
