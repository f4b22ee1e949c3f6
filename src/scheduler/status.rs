//! Status Snapshots
//!
//! `FlushControlCellInfo` is produced fresh on every evaluation pass and
//! published through a watch channel; consumers only ever get clones.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Evaluation phase of a pool group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupPhase {
    #[default]
    Idle,
    /// Membership query in flight
    Evaluating,
}

/// Snapshot of the flush controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushControlCellInfo {
    pub cell_name: String,
    /// Name of the loaded driver, if any
    pub driver_name: Option<String>,
    pub hsm_type: Option<String>,
    /// Gain-control interval
    pub update_interval_secs: u64,
    pub is_controlled: bool,
    pub pool_groups: Vec<String>,
    pub group_phases: BTreeMap<String, GroupPhase>,
    pub configured_pools: usize,
    pub status: String,
    pub driver_properties: BTreeMap<String, serde_json::Value>,
    /// Time since the driver last accepted properties
    pub driver_properties_age: Option<Duration>,
    pub driver_properties_updated: Option<DateTime<Utc>>,
    pub produced_at: DateTime<Utc>,
    /// Replies applied
    pub requests: u64,
    /// Replies or requests that could not be applied
    pub failed: u64,
}

impl FlushControlCellInfo {
    /// An empty snapshot for a controller that has not evaluated anything
    pub fn initial(cell_name: &str) -> Self {
        Self {
            cell_name: cell_name.to_string(),
            driver_name: None,
            hsm_type: None,
            update_interval_secs: 0,
            is_controlled: false,
            pool_groups: Vec::new(),
            group_phases: BTreeMap::new(),
            configured_pools: 0,
            status: "Starting".to_string(),
            driver_properties: BTreeMap::new(),
            driver_properties_age: None,
            driver_properties_updated: None,
            produced_at: Utc::now(),
            requests: 0,
            failed: 0,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl std::fmt::Display for FlushControlCellInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} driver={} controlled={} interval={}s groups=[{}] pools={} status={}",
            self.cell_name,
            self.driver_name.as_deref().unwrap_or("none"),
            self.is_controlled,
            self.update_interval_secs,
            self.pool_groups.join(","),
            self.configured_pools,
            self.status
        )
    }
}
