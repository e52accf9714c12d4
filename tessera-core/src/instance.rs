//! Server instance metadata

use serde::{Deserialize, Serialize};

use crate::DEFAULT_POOL;

/// A server registered in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub pool: u32,
}

fn default_enabled() -> bool {
    true
}

impl InstanceConfig {
    pub fn new(id: impl Into<String>, tags: &[&str]) -> Self {
        Self {
            id: id.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            enabled: true,
            pool: DEFAULT_POOL,
        }
    }

    pub fn with_pool(mut self, pool: u32) -> Self {
        self.pool = pool;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Disk usage snapshot reported by a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsageInfo {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub last_updated_ms: i64,
}

impl DiskUsageInfo {
    /// Fraction of capacity used after applying a byte delta
    pub fn projected_utilization(&self, delta_bytes: i64) -> f64 {
        if self.capacity_bytes == 0 {
            return 1.0;
        }
        let used = (self.used_bytes as i64 + delta_bytes).max(0);
        used as f64 / self.capacity_bytes as f64
    }
}
