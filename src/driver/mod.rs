//! HSM Driver Module
//!
//! Pluggable flush policies. A driver is created by name through the
//! [`DriverRegistry`], receives [`DriverEvent`]s from a dedicated worker task
//! and acts on pools through the [`FlushControlCore`] façade.

pub mod alternate;
pub mod alternating;
pub mod args;
pub mod registry;
pub mod worker;

pub use alternate::AlternateFlush;
pub use alternating::AlternatingFlush;
pub use args::DriverArgs;
pub use registry::{DriverFactory, DriverRegistration, DriverRegistry};
pub use worker::{DriverProperties, DriverWorker};

use crate::error::Result;
use crate::flush::{DriverEvent, FlushControlCore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A flush policy for one HSM type
///
/// All methods run on the driver worker task with the driver lock held, so
/// they must not block.
pub trait HsmControllable: Send {
    /// Name shown in status output
    fn name(&self) -> &str;

    /// Called once the pool setup is known and every pool answered
    fn init(&mut self, core: &dyn FlushControlCore) -> Result<()>;

    /// React to a core event
    fn handle_event(&mut self, core: &dyn FlushControlCore, event: &DriverEvent) -> Result<()>;

    /// Execute an operator command and describe the result
    fn command(&mut self, core: &dyn FlushControlCore, args: &DriverArgs) -> Result<String> {
        self.handle_event(core, &DriverEvent::Command(args.clone()))?;
        Ok("Command sent to driver".to_string())
    }

    /// Apply operator properties. Unsupported keys are removed and the
    /// effective values written back.
    fn properties_updated(&mut self, properties: &mut BTreeMap<String, String>) {
        properties.clear();
    }

    /// Extra details the driver knows about a storage class
    fn storage_info_details(&self, _storage_class: &str) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Called before the worker stops
    fn prepare_unload(&mut self, _core: &dyn FlushControlCore) {}
}

/// Shared handle to a loaded driver
pub type DriverRef = Arc<Mutex<Box<dyn HsmControllable>>>;
