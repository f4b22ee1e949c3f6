//! Configuration
//!
//! YAML description of a flush controller: pool groups, timing, driver
//! definitions, pool attractions and (for the loopback transport) simulated
//! pools. Command line values override the file.

use crate::attraction::{AttractionRegistry, PoolAttraction, StorageClassSelector};
use crate::domain::ports::{PoolCellInfo, PoolMode, StorageClassFlushInfo};
use crate::driver::{DriverArgs, DriverRegistry};
use crate::error::{Error, Result};
use crate::scheduler::{SchedulerConfig, MIN_CONTROL_INTERVAL};
use crate::transport::LoopbackTransport;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::info;

// =============================================================================
// Definitions
// =============================================================================

/// A driver bound to an HSM type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDefinition {
    pub hsm_type: String,
    /// Driver class name as registered with the driver registry
    pub driver: String,
    /// Admin-style arguments (`-key=value`, positional words)
    #[serde(default)]
    pub args: Vec<String>,
}

/// One attraction of a pool. Exactly one of `storage_class` and `template`
/// must be given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttractionDefinition {
    pub hsm: String,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub template: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub read: i32,
    #[serde(default)]
    pub write: i32,
}

impl AttractionDefinition {
    pub fn to_attraction(&self) -> Result<PoolAttraction> {
        let selector = match (&self.storage_class, &self.template) {
            (Some(name), None) => StorageClassSelector::exact(name.clone()),
            (None, Some(template)) => StorageClassSelector::Template(template.clone()),
            _ => {
                return Err(Error::Configuration(format!(
                    "attraction for hsm {} needs either storage_class or template",
                    self.hsm
                )))
            }
        };
        Ok(PoolAttraction::new(
            self.hsm.clone(),
            selector,
            self.read,
            self.write,
        ))
    }
}

/// Pending backlog of a simulated storage class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedClassDefinition {
    pub hsm: String,
    pub storage_class: String,
    #[serde(default)]
    pub pending_files: u32,
    #[serde(default)]
    pub pending_bytes: u64,
}

/// Initial state of a loopback pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedPoolDefinition {
    pub total_space: u64,
    pub precious_space: u64,
    pub read_only: bool,
    pub storage_classes: Vec<SimulatedClassDefinition>,
}

/// A pool known to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDefinition {
    pub name: String,
    /// Transport address, the pool name when absent
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub attractions: Vec<AttractionDefinition>,
    /// Present for pools served by the loopback transport
    #[serde(default)]
    pub simulated: Option<SimulatedPoolDefinition>,
}

impl PoolDefinition {
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }
}

// =============================================================================
// Flush Control Configuration
// =============================================================================

/// Complete controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushControlConfig {
    pub cell_name: String,
    pub pool_groups: Vec<String>,
    /// HSM type whose driver is loaded at startup
    pub scheduler: Option<String>,
    pub controlled: bool,
    pub gain_control_interval_secs: u64,
    pub timer_secs: u64,
    pub pool_collection_interval_secs: u64,
    pub initial_delay_secs: u64,
    /// Options merged under every driver's own arguments
    pub driver_options: BTreeMap<String, String>,
    pub drivers: Vec<DriverDefinition>,
    pub pools: Vec<PoolDefinition>,
}

impl Default for FlushControlConfig {
    fn default() -> Self {
        Self {
            cell_name: "FlushManager".to_string(),
            pool_groups: Vec::new(),
            scheduler: None,
            controlled: true,
            gain_control_interval_secs: 60,
            timer_secs: 30,
            pool_collection_interval_secs: 120,
            initial_delay_secs: 10,
            driver_options: BTreeMap::new(),
            drivers: Vec::new(),
            pools: Vec::new(),
        }
    }
}

impl FlushControlConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: FlushControlConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&yaml)?;
        info!(path = %path.display(), pools = config.pools.len(), "Configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cell_name.trim().is_empty() {
            return Err(Error::Configuration("cell_name must not be empty".to_string()));
        }
        if self.gain_control_interval_secs < MIN_CONTROL_INTERVAL.as_secs() {
            return Err(Error::Configuration(format!(
                "gain_control_interval_secs must be at least {}",
                MIN_CONTROL_INTERVAL.as_secs()
            )));
        }
        if self.timer_secs == 0 || self.pool_collection_interval_secs == 0 {
            return Err(Error::Configuration(
                "timer_secs and pool_collection_interval_secs must be positive".to_string(),
            ));
        }

        let mut hsm_types = BTreeSet::new();
        for driver in &self.drivers {
            if !hsm_types.insert(driver.hsm_type.to_lowercase()) {
                return Err(Error::Configuration(format!(
                    "driver for hsm type {} defined twice",
                    driver.hsm_type
                )));
            }
        }
        if let Some(scheduler) = &self.scheduler {
            if !hsm_types.contains(&scheduler.to_lowercase()) {
                return Err(Error::Configuration(format!(
                    "scheduler {} has no driver definition",
                    scheduler
                )));
            }
        }

        let mut names = BTreeSet::new();
        for pool in &self.pools {
            if !names.insert(pool.name.as_str()) {
                return Err(Error::Configuration(format!("pool {} defined twice", pool.name)));
            }
            for attraction in &pool.attractions {
                attraction.to_attraction()?;
            }
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            cell_name: self.cell_name.clone(),
            pool_groups: self.pool_groups.clone(),
            controlled: self.controlled,
            gain_control_interval: Duration::from_secs(self.gain_control_interval_secs),
            timer_interval: Duration::from_secs(self.timer_secs),
            pool_collection_interval: Duration::from_secs(self.pool_collection_interval_secs),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            ..SchedulerConfig::default()
        }
    }

    /// Global driver options as argument bundle
    pub fn global_driver_options(&self) -> DriverArgs {
        DriverArgs {
            args: Vec::new(),
            options: self.driver_options.clone(),
        }
    }

    /// Define every configured driver
    pub fn define_drivers(&self, registry: &DriverRegistry) -> Result<()> {
        for driver in &self.drivers {
            registry.define(
                &driver.hsm_type,
                &driver.driver,
                DriverArgs::parse(&driver.args),
            )?;
        }
        Ok(())
    }

    /// Register every pool's attractions
    pub fn register_attractions(&self, registry: &AttractionRegistry) -> Result<()> {
        for pool in &self.pools {
            let attractions = pool
                .attractions
                .iter()
                .map(AttractionDefinition::to_attraction)
                .collect::<Result<Vec<_>>>()?;
            registry.add_pool_info(pool.name.clone(), pool.address(), attractions);
        }
        Ok(())
    }

    /// Create the simulated pools on a loopback transport
    pub fn populate_loopback(&self, transport: &LoopbackTransport) {
        for group in &self.pool_groups {
            transport.add_group(group);
        }
        for pool in &self.pools {
            let simulated = match &pool.simulated {
                Some(simulated) => simulated,
                None => continue,
            };
            let groups: Vec<&str> = pool.groups.iter().map(String::as_str).collect();
            transport.add_pool_at(&pool.name, pool.address(), &groups);
            transport.set_cell_info(
                pool.address(),
                PoolCellInfo {
                    total_space: simulated.total_space,
                    free_space: simulated.total_space.saturating_sub(simulated.precious_space),
                    precious_space: simulated.precious_space,
                    ..Default::default()
                },
            );
            let read_only = simulated.read_only;
            transport.update_pool(pool.address(), |p| p.mode = PoolMode::from_read_only(read_only));
            for class in &simulated.storage_classes {
                transport.set_storage_class(
                    pool.address(),
                    StorageClassFlushInfo {
                        request_count: class.pending_files,
                        total_pending_file_size: class.pending_bytes,
                        ..StorageClassFlushInfo::new(class.hsm.clone(), class.storage_class.clone())
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attraction::StorageClassSelector;
    use assert_matches::assert_matches;
    use std::io::Write;

    const SAMPLE: &str = r#"
cell_name: tape-flush
pool_groups: [writers]
scheduler: osm
gain_control_interval_secs: 60
timer_secs: 15
driver_options:
  flush.count: "7"
drivers:
  - hsm_type: osm
    driver: alternate
    args: ["-flush.percentage=0.3"]
pools:
  - name: pool-a
    groups: [writers]
    attractions:
      - hsm: osm
        storage_class: raw
        read: 10
        write: 10
      - hsm: osm
        template: { experiment: atlas }
        write: 3
    simulated:
      total_space: 1000
      precious_space: 600
      storage_classes:
        - hsm: osm
          storage_class: raw
          pending_files: 6
          pending_bytes: 600
  - name: pool-b
    address: pool-b@remote
"#;

    #[test]
    fn test_parse_sample() {
        let config = FlushControlConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.cell_name, "tape-flush");
        assert_eq!(config.scheduler.as_deref(), Some("osm"));
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[1].address(), "pool-b@remote");

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.timer_interval, Duration::from_secs(15));
        assert_eq!(scheduler.pool_collection_interval, Duration::from_secs(120));

        let template = config.pools[0].attractions[1].to_attraction().unwrap();
        assert_matches!(template.selector, StorageClassSelector::Template(ref t) if t["experiment"] == "atlas");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = FlushControlConfig::from_file(file.path()).unwrap();
        assert_eq!(config.drivers[0].driver, "alternate");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FlushControlConfig::from_file(dir.path().join("absent.yaml")).unwrap_err();
        assert_matches!(err, Error::Io(_));
    }

    #[test]
    fn test_validation() {
        let err = FlushControlConfig::from_yaml_str("gain_control_interval_secs: 10").unwrap_err();
        assert_matches!(err, Error::Configuration(_));

        let err = FlushControlConfig::from_yaml_str("scheduler: tsm").unwrap_err();
        assert_matches!(err, Error::Configuration(ref m) if m.contains("tsm"));

        let yaml = "pools:\n  - name: p\n    attractions:\n      - hsm: osm\n        write: 1\n";
        assert_matches!(FlushControlConfig::from_yaml_str(yaml), Err(Error::Configuration(_)));

        let err = FlushControlConfig::from_yaml_str("pools: [").unwrap_err();
        assert_matches!(err, Error::YamlParse(_));
    }

    #[test]
    fn test_wiring_helpers() {
        let config = FlushControlConfig::from_yaml_str(SAMPLE).unwrap();

        let attractions = AttractionRegistry::new();
        config.register_attractions(&attractions).unwrap();
        assert_eq!(attractions.pool_path("pool-b").unwrap().as_str(), "pool-b@remote");
        assert_eq!(attractions.sorted_candidates_by_class("OSM", "raw", true).len(), 1);

        let drivers = DriverRegistry::with_builtin_drivers()
            .with_global_options(config.global_driver_options());
        config.define_drivers(&drivers).unwrap();
        let registration = drivers.lookup("osm").unwrap();
        assert_eq!(registration.load_args.option("flush.count"), Some("7"));
        assert_eq!(registration.load_args.option("flush.percentage"), Some("0.3"));

        let transport = LoopbackTransport::new();
        config.populate_loopback(&transport);
        let pool = transport.pool("pool-a").unwrap();
        assert_eq!(pool.cell_info.precious_space, 600);
        assert_eq!(pool.flush_infos["raw@osm"].request_count, 6);
        assert!(transport.pool("pool-b@remote").is_none());
    }
}
