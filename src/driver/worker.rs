//! Driver Worker
//!
//! One task per loaded driver. Events are handled strictly in arrival order
//! with the driver lock held; nothing awaits while the lock is taken.

use super::registry::DriverRegistration;
use super::DriverRef;
use crate::error::{Error, Result};
use crate::flush::events::DriverMessage;
use crate::flush::{DriverEvent, FlushControl, FlushControlCore};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Effective driver properties as last accepted by the driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverProperties {
    pub values: BTreeMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct WorkerStats {
    events: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Running driver worker
pub struct DriverWorker {
    registration: DriverRegistration,
    initialized: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for DriverWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverWorker")
            .field("hsm_type", &self.registration.hsm_type)
            .field("driver_class", &self.registration.driver_class)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl DriverWorker {
    /// Attach the driver to the core and start its worker task
    pub(crate) fn spawn(
        registration: DriverRegistration,
        control: Arc<FlushControl>,
        properties: Arc<RwLock<DriverProperties>>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        control.set_driver_args(registration.load_args.clone());
        control.attach_driver(sender);

        let initialized = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(WorkerStats::default());
        let handle = tokio::spawn(run(
            registration.driver.clone(),
            control,
            receiver,
            initialized.clone(),
            stats.clone(),
            properties,
        ));

        info!(
            hsm_type = %registration.hsm_type,
            driver_class = %registration.driver_class,
            "Driver worker started"
        );

        Self {
            registration,
            initialized,
            stats,
            handle,
        }
    }

    pub fn registration(&self) -> &DriverRegistration {
        &self.registration
    }

    pub fn driver_name(&self) -> String {
        self.registration.driver_name()
    }

    /// True once `init` ran successfully
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Events handed to the driver
    pub fn events_handled(&self) -> u64 {
        self.stats.events.load(Ordering::Relaxed)
    }

    /// Events dropped because the driver was not initialized yet
    pub fn events_dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.stats.errors.load(Ordering::Relaxed)
    }

    /// Detach from the core and wait for the worker to drain its queue and
    /// call `prepare_unload`
    pub(crate) async fn stop(self, control: &FlushControl) {
        control.detach_driver();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Driver worker ended abnormally");
        }
        info!(hsm_type = %self.registration.hsm_type, "Driver worker stopped");
    }
}

fn try_init(driver: &DriverRef, control: &FlushControl) -> Result<bool> {
    if !(control.is_pool_setup_ready() && control.is_pool_config_done()) {
        return Ok(false);
    }
    let core: &dyn FlushControlCore = control;
    driver.lock().init(core)?;
    control.query_all_pool_modes()?;
    Ok(true)
}

fn not_ready() -> Error {
    Error::Driver("driver is waiting for the pool setup".to_string())
}

async fn run(
    driver: DriverRef,
    control: Arc<FlushControl>,
    mut receiver: mpsc::UnboundedReceiver<DriverMessage>,
    initialized: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    properties: Arc<RwLock<DriverProperties>>,
) {
    while let Some(message) = receiver.recv().await {
        if !initialized.load(Ordering::Acquire) {
            match try_init(&driver, &control) {
                Ok(true) => {
                    initialized.store(true, Ordering::Release);
                    info!(driver = %driver.lock().name(), "Driver initialized");
                }
                Ok(false) => {}
                Err(e) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Driver init failed, retrying on next event");
                }
            }
        }

        if !initialized.load(Ordering::Acquire) {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            match message {
                DriverMessage::Event(event) => {
                    debug!(event = event.kind(), "Driver not initialized, event dropped");
                }
                DriverMessage::Command { respond_to, .. } => {
                    let _ = respond_to.send(Err(not_ready()));
                }
                DriverMessage::StorageInfo { respond_to, .. } => {
                    let _ = respond_to.send(Err(not_ready()));
                }
            }
            continue;
        }

        stats.events.fetch_add(1, Ordering::Relaxed);
        let core: &dyn FlushControlCore = control.as_ref();
        match message {
            DriverMessage::Command { args, respond_to } => {
                let result = driver.lock().command(core, &args);
                if let Err(e) = &result {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(command = %args, error = %e, "Driver command failed");
                }
                let _ = respond_to.send(result);
            }
            DriverMessage::StorageInfo {
                storage_class,
                respond_to,
            } => {
                let details = driver.lock().storage_info_details(&storage_class);
                let _ = respond_to.send(Ok(details));
            }
            DriverMessage::Event(DriverEvent::PropertiesUpdated(mut values)) => {
                driver.lock().properties_updated(&mut values);
                debug!(properties = ?values, "Driver properties accepted");
                let mut current = properties.write();
                current.values = values;
                current.updated_at = Some(Utc::now());
            }
            DriverMessage::Event(event) => {
                let result = driver.lock().handle_event(core, &event);
                if let Err(e) = result {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(event = event.kind(), error = %e, "Driver reported an error");
                }
            }
        }
    }

    let core: &dyn FlushControlCore = control.as_ref();
    driver.lock().prepare_unload(core);
    debug!("Driver worker event loop ended");
}
