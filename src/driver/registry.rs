//! Driver Registry
//!
//! Maps HSM types to loaded drivers. Driver classes are resolved through
//! factories registered at startup; a driver is instantiated once per
//! `define` and reused until the HSM type is redefined.

use super::alternate::AlternateFlush;
use super::alternating::AlternatingFlush;
use super::args::DriverArgs;
use super::{DriverRef, HsmControllable};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Constructor for a driver class
pub type DriverFactory =
    Arc<dyn Fn(&DriverArgs) -> Result<Box<dyn HsmControllable>> + Send + Sync>;

/// A loaded driver bound to an HSM type
#[derive(Clone)]
pub struct DriverRegistration {
    pub hsm_type: String,
    pub driver_class: String,
    pub driver: DriverRef,
    pub load_args: DriverArgs,
    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for DriverRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistration")
            .field("hsm_type", &self.hsm_type)
            .field("driver_class", &self.driver_class)
            .field("load_args", &self.load_args)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

impl DriverRegistration {
    /// Name reported by the driver itself
    pub fn driver_name(&self) -> String {
        self.driver.lock().name().to_string()
    }

    /// Both registrations refer to the same driver instance
    pub fn same_instance(&self, other: &DriverRegistration) -> bool {
        Arc::ptr_eq(&self.driver, &other.driver)
    }
}

/// Registry of driver classes and loaded drivers
pub struct DriverRegistry {
    factories: RwLock<BTreeMap<String, DriverFactory>>,
    registrations: RwLock<BTreeMap<String, DriverRegistration>>,
    global_options: DriverArgs,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("driver_classes", &self.driver_classes())
            .field("hsm_types", &self.registrations.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// An empty registry without any driver class
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
            registrations: RwLock::new(BTreeMap::new()),
            global_options: DriverArgs::default(),
        }
    }

    /// A registry knowing the drivers shipped with this crate
    pub fn with_builtin_drivers() -> Self {
        let registry = Self::new();
        for class in ["alternate", "alternate-flush"] {
            registry.register_factory(class, |args: &DriverArgs| {
                Ok(Box::new(AlternateFlush::new(args)) as Box<dyn HsmControllable>)
            });
        }
        for class in ["alternating", "alternating-flush-v1"] {
            registry.register_factory(class, |args: &DriverArgs| {
                Ok(Box::new(AlternatingFlush::new(args)) as Box<dyn HsmControllable>)
            });
        }
        registry
    }

    /// Options merged under the per-load options of every `define`
    pub fn with_global_options(mut self, options: DriverArgs) -> Self {
        self.global_options = options;
        self
    }

    pub fn global_options(&self) -> &DriverArgs {
        &self.global_options
    }

    /// Make a driver class available. Class names are case-insensitive.
    pub fn register_factory<F>(&self, driver_class: &str, factory: F)
    where
        F: Fn(&DriverArgs) -> Result<Box<dyn HsmControllable>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(driver_class.to_lowercase(), Arc::new(factory));
    }

    pub fn driver_classes(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// Instantiate `driver_class` and bind it to `hsm_type`, replacing any
    /// previous binding. On failure the previous binding stays.
    pub fn define(
        &self,
        hsm_type: &str,
        driver_class: &str,
        load_args: DriverArgs,
    ) -> Result<DriverRegistration> {
        let factory = self
            .factories
            .read()
            .get(&driver_class.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::DriverLoad {
                driver_class: driver_class.to_string(),
                reason: "unknown driver class".to_string(),
            })?;

        let args = load_args.merged_over(&self.global_options);
        let driver = factory(&args).map_err(|e| {
            warn!(hsm_type = %hsm_type, driver_class = %driver_class, "Driver load failed: {}", e);
            Error::DriverLoad {
                driver_class: driver_class.to_string(),
                reason: e.to_string(),
            }
        })?;

        let registration = DriverRegistration {
            hsm_type: hsm_type.to_lowercase(),
            driver_class: driver_class.to_string(),
            driver: Arc::new(Mutex::new(driver)),
            load_args: args,
            loaded_at: Utc::now(),
        };

        let previous = self
            .registrations
            .write()
            .insert(registration.hsm_type.clone(), registration.clone());

        info!(
            hsm_type = %registration.hsm_type,
            driver_class = %driver_class,
            replaced = previous.is_some(),
            "Driver defined"
        );
        Ok(registration)
    }

    pub fn lookup(&self, hsm_type: &str) -> Result<DriverRegistration> {
        self.registrations
            .read()
            .get(&hsm_type.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::DriverNotFound {
                hsm_type: hsm_type.to_string(),
            })
    }

    /// All registrations ordered by HSM type
    pub fn list(&self) -> Vec<DriverRegistration> {
        self.registrations.read().values().cloned().collect()
    }

    pub fn undefine(&self, hsm_type: &str) -> bool {
        let removed = self
            .registrations
            .write()
            .remove(&hsm_type.to_lowercase())
            .is_some();
        if removed {
            info!(hsm_type = %hsm_type, "Driver undefined");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flush::{DriverEvent, FlushControlCore};
    use assert_matches::assert_matches;

    struct NamedDriver {
        name: String,
    }

    impl HsmControllable for NamedDriver {
        fn name(&self) -> &str {
            &self.name
        }

        fn init(&mut self, _core: &dyn FlushControlCore) -> Result<()> {
            Ok(())
        }

        fn handle_event(&mut self, _core: &dyn FlushControlCore, _event: &DriverEvent) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> DriverRegistry {
        let registry = DriverRegistry::with_builtin_drivers();
        registry.register_factory("com.example.EnstoreDriver", |args: &DriverArgs| {
            let name = args.option("name").unwrap_or("enstore").to_string();
            Ok(Box::new(NamedDriver { name }) as Box<dyn HsmControllable>)
        });
        registry.register_factory("com.example.Broken", |_args: &DriverArgs| {
            Err(Error::Driver("cannot open state file".into()))
        });
        registry
    }

    #[test]
    fn test_define_and_lookup_same_instance() {
        let registry = registry();
        registry
            .define("enstore", "com.example.EnstoreDriver", DriverArgs::default())
            .unwrap();

        let first = registry.lookup("enstore").unwrap();
        let second = registry.lookup("ENSTORE").unwrap();
        assert!(first.same_instance(&second));
        assert_eq!(first.driver_name(), "enstore");
    }

    #[test]
    fn test_redefine_overwrites() {
        let registry = registry();
        let first = registry
            .define("osm", "com.example.EnstoreDriver", DriverArgs::default())
            .unwrap();
        registry
            .define(
                "osm",
                "com.example.EnstoreDriver",
                DriverArgs::default().with_option("name", "second"),
            )
            .unwrap();

        let current = registry.lookup("osm").unwrap();
        assert!(!current.same_instance(&first));
        assert_eq!(current.driver_name(), "second");
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_failed_define_keeps_previous() {
        let registry = registry();
        let original = registry.define("osm", "alternate", DriverArgs::default()).unwrap();

        let err = registry
            .define("osm", "com.example.Broken", DriverArgs::default())
            .unwrap_err();
        assert_matches!(err, Error::DriverLoad { ref reason, .. } if reason.contains("state file"));

        let err = registry
            .define("osm", "no.such.Driver", DriverArgs::default())
            .unwrap_err();
        assert_matches!(err, Error::DriverLoad { .. });

        assert!(registry.lookup("osm").unwrap().same_instance(&original));
    }

    #[test]
    fn test_builtin_drivers() {
        let registry = DriverRegistry::with_builtin_drivers();
        assert_eq!(
            registry.driver_classes(),
            vec!["alternate", "alternate-flush", "alternating", "alternating-flush-v1"]
        );

        let registration = registry
            .define("osm", "Alternating-Flush-V1", DriverArgs::parse_line("-max.files=20"))
            .unwrap();
        assert_eq!(registration.driver_name(), "alternating");
        let details = registration.driver.lock().storage_info_details("raw@osm");
        assert_eq!(details.get("driver").map(String::as_str), Some("alternating"));
    }

    #[test]
    fn test_lookup_unknown() {
        let registry = registry();
        assert_matches!(registry.lookup("tsm"), Err(Error::DriverNotFound { .. }));
    }

    #[test]
    fn test_list_ordered_and_undefine() {
        let registry = registry();
        registry.define("tsm", "alternate", DriverArgs::default()).unwrap();
        registry.define("enstore", "alternate", DriverArgs::default()).unwrap();
        registry.define("osm", "ALTERNATE", DriverArgs::default()).unwrap();

        let types: Vec<String> = registry.list().into_iter().map(|r| r.hsm_type).collect();
        assert_eq!(types, vec!["enstore", "osm", "tsm"]);

        assert!(registry.undefine("osm"));
        assert!(!registry.undefine("osm"));
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_global_options_merged() {
        let registry = registry()
            .with_global_options(DriverArgs::parse_line("-flush.count=7 -name=global"));
        let registration = registry
            .define(
                "enstore",
                "com.example.EnstoreDriver",
                DriverArgs::parse_line("-name=local"),
            )
            .unwrap();

        assert_eq!(registration.load_args.option("flush.count"), Some("7"));
        assert_eq!(registration.driver_name(), "local");
    }
}
