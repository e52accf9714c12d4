//! Table configuration
//!
//! Only the parts of a table config the placement engine reads:
//! - Table type, replication and server tag
//! - Instance assignment (replica group / partition) configs per type
//! - Tier configs
//! - Routing flags

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, TesseraError};
use crate::TIER_SEPARATOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TableType {
    Offline,
    Realtime,
}

impl TableType {
    pub fn suffix(self) -> &'static str {
        match self {
            TableType::Offline => "_OFFLINE",
            TableType::Realtime => "_REALTIME",
        }
    }
}

/// Strip the type suffix from a table name
pub fn raw_table_name(table_name_with_type: &str) -> &str {
    table_name_with_type
        .strip_suffix(TableType::Offline.suffix())
        .or_else(|| table_name_with_type.strip_suffix(TableType::Realtime.suffix()))
        .unwrap_or(table_name_with_type)
}

/// Which segments an instance partitions object serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstancePartitionsType {
    Offline,
    Consuming,
    Completed,
}

impl InstancePartitionsType {
    /// `<rawTableName>_<TYPE>`
    pub fn instance_partitions_name(self, table_name: &str) -> String {
        format!("{}_{}", raw_table_name(table_name), self)
    }
}

impl fmt::Display for InstancePartitionsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstancePartitionsType::Offline => "OFFLINE",
            InstancePartitionsType::Consuming => "CONSUMING",
            InstancePartitionsType::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionSelector {
    #[default]
    Default,
    /// One partition per stream partition, one instance per partition
    ImplicitRealtimeTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicaGroupPartitionConfig {
    pub replica_group_based: bool,
    pub num_replica_groups: usize,
    /// 0 means as many as the pool allows
    pub num_instances_per_replica_group: usize,
    pub num_partitions: usize,
    /// 0 means every member of the replica group
    pub num_instances_per_partition: usize,
    pub partition_column: Option<String>,
    /// Allow one server to sit in several replica groups when the pool is small
    pub allow_instance_reuse: bool,
}

impl Default for ReplicaGroupPartitionConfig {
    fn default() -> Self {
        Self {
            replica_group_based: false,
            num_replica_groups: 1,
            num_instances_per_replica_group: 0,
            num_partitions: 1,
            num_instances_per_partition: 0,
            partition_column: None,
            allow_instance_reuse: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAssignmentConfig {
    /// Tag that selects the server pool
    pub tag: String,
    #[serde(default)]
    pub replica_group_partition: ReplicaGroupPartitionConfig,
    #[serde(default)]
    pub minimize_data_movement: bool,
    #[serde(default)]
    pub partition_selector: PartitionSelector,
}

impl InstanceAssignmentConfig {
    pub fn replica_group(tag: impl Into<String>, num_replica_groups: usize, num_instances_per_replica_group: usize) -> Self {
        Self {
            tag: tag.into(),
            replica_group_partition: ReplicaGroupPartitionConfig {
                replica_group_based: true,
                num_replica_groups,
                num_instances_per_replica_group,
                ..Default::default()
            },
            minimize_data_movement: false,
            partition_selector: PartitionSelector::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TierSelector {
    /// Segments whose end time is older than `segment_age` (e.g. "7d", "36h")
    #[serde(rename = "time", rename_all = "camelCase")]
    Time { segment_age: String },
    /// An explicit list of segment names
    #[serde(rename = "fixed")]
    Fixed { segments: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub name: String,
    pub selector: TierSelector,
    pub server_tag: String,
}

impl TierConfig {
    pub fn time(name: impl Into<String>, segment_age: impl Into<String>, server_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: TierSelector::Time {
                segment_age: segment_age.into(),
            },
            server_tag: server_tag.into(),
        }
    }

    pub fn fixed(name: impl Into<String>, segments: &[&str], server_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: TierSelector::Fixed {
                segments: segments.iter().map(|s| s.to_string()).collect(),
            },
            server_tag: server_tag.into(),
        }
    }

    /// Age threshold of a time tier
    pub fn segment_age(&self) -> Result<Option<Duration>> {
        match &self.selector {
            TierSelector::Time { segment_age } => parse_period(segment_age).map(Some),
            TierSelector::Fixed { .. } => Ok(None),
        }
    }

    /// `<tableNameWithType>__TIER__<tierName>`
    pub fn instance_partitions_name(&self, table_name: &str) -> String {
        format!("{}{}{}", table_name, TIER_SEPARATOR, self.name)
    }
}

/// Parse a period such as "7d", "12h", "30m" or "45s"
pub fn parse_period(period: &str) -> Result<Duration> {
    let period = period.trim();
    let invalid = || TesseraError::InvalidConfig(format!("invalid period: '{}'", period));
    let unit = period.chars().last().ok_or_else(invalid)?;
    let value: u64 = period[..period.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    let secs = match unit.to_ascii_lowercase() {
        'd' => value * 24 * 3600,
        'h' => value * 3600,
        'm' => value * 60,
        's' => value,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingConfig {
    pub strict_replica_group: bool,
    /// Route every query of the table to the same replica ordering
    pub use_fixed_replica: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableConfig {
    /// Name including the `_OFFLINE` / `_REALTIME` suffix
    pub table_name: String,
    pub table_type: TableType,
    pub replication: usize,
    pub server_tag: String,
    #[serde(default)]
    pub instance_assignment: BTreeMap<InstancePartitionsType, InstanceAssignmentConfig>,
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub pauseless: bool,
    /// Number of stream partitions for realtime tables
    #[serde(default)]
    pub stream_partitions: Option<usize>,
}

impl TableConfig {
    pub fn offline(raw_name: &str, replication: usize, server_tag: impl Into<String>) -> Self {
        Self::new(raw_name, TableType::Offline, replication, server_tag)
    }

    pub fn realtime(raw_name: &str, replication: usize, server_tag: impl Into<String>, stream_partitions: usize) -> Self {
        let mut config = Self::new(raw_name, TableType::Realtime, replication, server_tag);
        config.stream_partitions = Some(stream_partitions);
        config
    }

    fn new(raw_name: &str, table_type: TableType, replication: usize, server_tag: impl Into<String>) -> Self {
        Self {
            table_name: format!("{}{}", raw_name, table_type.suffix()),
            table_type,
            replication,
            server_tag: server_tag.into(),
            instance_assignment: BTreeMap::new(),
            tiers: Vec::new(),
            routing: RoutingConfig::default(),
            pauseless: false,
            stream_partitions: None,
        }
    }

    pub fn is_realtime(&self) -> bool {
        self.table_type == TableType::Realtime
    }

    /// Instance partitions types this table places segments with
    pub fn instance_partitions_types(&self) -> Vec<InstancePartitionsType> {
        match self.table_type {
            TableType::Offline => vec![InstancePartitionsType::Offline],
            TableType::Realtime => {
                let mut types = vec![InstancePartitionsType::Consuming];
                if self
                    .instance_assignment
                    .contains_key(&InstancePartitionsType::Completed)
                {
                    types.push(InstancePartitionsType::Completed);
                }
                types
            }
        }
    }

    pub fn instance_assignment_config(&self, ty: InstancePartitionsType) -> Option<&InstanceAssignmentConfig> {
        self.instance_assignment.get(&ty)
    }

    /// Server tag backing an instance partitions type
    pub fn tag_for(&self, ty: InstancePartitionsType) -> &str {
        self.instance_assignment_config(ty)
            .map(|c| c.tag.as_str())
            .unwrap_or(&self.server_tag)
    }

    /// Whether instance assignment is driven by an explicit config
    pub fn allows_instance_assignment(&self) -> bool {
        !self.instance_assignment.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication == 0 {
            return Err(TesseraError::InvalidConfig(format!(
                "replication of {} must be positive",
                self.table_name
            )));
        }
        if !self.table_name.ends_with(self.table_type.suffix()) {
            return Err(TesseraError::InvalidConfig(format!(
                "table name {} does not end with {}",
                self.table_name,
                self.table_type.suffix()
            )));
        }
        for tier in &self.tiers {
            tier.segment_age()?;
        }
        Ok(())
    }
}
