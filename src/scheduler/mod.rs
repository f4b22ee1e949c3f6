//! Flush Scheduler
//!
//! Drives the flush control core: collects pool group membership, sends
//! gain-control requests, forwards timer ticks to the driver and publishes
//! status snapshots. Admin operations are plain method calls.

pub mod status;

pub use status::{FlushControlCellInfo, GroupPhase};

use crate::attraction::AttractionRegistry;
use crate::domain::ports::{ReplySink, TransportRef};
use crate::driver::{DriverArgs, DriverProperties, DriverRegistry, DriverWorker};
use crate::error::{Error, Result};
use crate::flush::{
    spawn_dispatcher, DriverEvent, FlushControl, FlushControlCore, PoolDetails, PoolSetChange,
};
use crate::metrics::FlushMetrics;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest accepted gain-control interval
pub const MIN_CONTROL_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Scheduler Configuration
// =============================================================================

/// Configuration for the flush scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name used in status snapshots
    pub cell_name: String,
    /// Pool groups whose members are put under flush control
    pub pool_groups: Vec<String>,
    /// Whether mutating calls are permitted
    pub controlled: bool,
    /// How often pools are asked for their flush backlog
    pub gain_control_interval: Duration,
    /// How often the driver gets a timer event
    pub timer_interval: Duration,
    /// How often pool group membership is collected
    pub pool_collection_interval: Duration,
    /// Wait before the first evaluation
    pub initial_delay: Duration,
    /// Resolution of the scheduler loop
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cell_name: "FlushManager".to_string(),
            pool_groups: Vec::new(),
            controlled: true,
            gain_control_interval: Duration::from_secs(60),
            timer_interval: Duration::from_secs(30),
            pool_collection_interval: Duration::from_secs(120),
            initial_delay: Duration::from_secs(10),
            tick: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Scheduler State
// =============================================================================

#[derive(Debug)]
struct SchedulerState {
    pool_groups: Vec<String>,
    group_phases: BTreeMap<String, GroupPhase>,
    controlled: bool,
    gain_control_interval: Duration,
    timer_interval: Duration,
    pool_collection_interval: Duration,
    status: String,
}

/// Resets the collecting flag however a collection ends
struct CollectingGuard<'a>(&'a AtomicBool);

impl Drop for CollectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn due(last: Option<Instant>, every: Duration, now: Instant) -> bool {
    match last {
        Some(last) => now.duration_since(last) >= every,
        None => true,
    }
}

// =============================================================================
// Flush Scheduler
// =============================================================================

/// The flush controller
pub struct FlushScheduler {
    cell_name: String,
    initial_delay: Duration,
    tick: Duration,
    control: Arc<FlushControl>,
    transport: TransportRef,
    drivers: Arc<DriverRegistry>,
    state: RwLock<SchedulerState>,
    worker: Mutex<Option<DriverWorker>>,
    driver_properties: Arc<RwLock<DriverProperties>>,
    collecting: AtomicBool,
    collect_requested: AtomicBool,
    gain_control_requested: AtomicBool,
    wake: Notify,
    status_tx: watch::Sender<FlushControlCellInfo>,
    dispatcher_cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("cell_name", &self.cell_name)
            .field("transport", &self.transport.name())
            .field("state", &*self.state.read())
            .finish()
    }
}

impl FlushScheduler {
    /// Create the scheduler and start its request dispatcher. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        transport: TransportRef,
        drivers: Arc<DriverRegistry>,
        attractions: Option<Arc<AttractionRegistry>>,
    ) -> Result<Arc<Self>> {
        if config.gain_control_interval < MIN_CONTROL_INTERVAL {
            return Err(Error::Configuration(format!(
                "gain control interval must be at least {}s",
                MIN_CONTROL_INTERVAL.as_secs()
            )));
        }

        let metrics = FlushMetrics::new()
            .map_err(|e| Error::Internal(format!("metrics registration failed: {}", e)))?;
        let (control, inputs) = FlushControl::new(metrics, attractions);
        control.set_controlled(config.controlled);

        let dispatcher_cancel = CancellationToken::new();
        let dispatcher = spawn_dispatcher(
            control.clone(),
            transport.clone(),
            inputs,
            dispatcher_cancel.clone(),
        );

        let mut group_phases = BTreeMap::new();
        let mut pool_groups = Vec::new();
        for group in config.pool_groups {
            if !pool_groups.contains(&group) {
                group_phases.insert(group.clone(), GroupPhase::Idle);
                pool_groups.push(group);
            }
        }

        let (status_tx, _) = watch::channel(FlushControlCellInfo::initial(&config.cell_name));

        info!(
            cell = %config.cell_name,
            transport = transport.name(),
            groups = ?pool_groups,
            controlled = config.controlled,
            "Flush scheduler created"
        );

        Ok(Arc::new(Self {
            cell_name: config.cell_name,
            initial_delay: config.initial_delay,
            tick: config.tick,
            control,
            transport,
            drivers,
            state: RwLock::new(SchedulerState {
                pool_groups,
                group_phases,
                controlled: config.controlled,
                gain_control_interval: config.gain_control_interval,
                timer_interval: config.timer_interval,
                pool_collection_interval: config.pool_collection_interval,
                status: "Starting".to_string(),
            }),
            worker: Mutex::new(None),
            driver_properties: Arc::new(RwLock::new(DriverProperties::default())),
            collecting: AtomicBool::new(false),
            collect_requested: AtomicBool::new(false),
            gain_control_requested: AtomicBool::new(false),
            wake: Notify::new(),
            status_tx,
            dispatcher_cancel,
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }

    /// The core the loaded driver talks to
    pub fn control(&self) -> &Arc<FlushControl> {
        &self.control
    }

    pub fn metrics(&self) -> &FlushMetrics {
        self.control.metrics()
    }

    /// Channel on which the transport pushes unsolicited replies
    pub fn reply_sink(&self) -> ReplySink {
        self.control.reply_sink()
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Collect the members of every pool group and rebuild the configured
    /// pool set. A collection already in progress is skipped.
    pub async fn refresh(&self) -> Result<PoolSetChange> {
        if self.collecting.swap(true, Ordering::AcqRel) {
            warn!("Pool collection still in progress, skipping");
            return Ok(PoolSetChange::default());
        }
        let _guard = CollectingGuard(&self.collecting);

        let groups = {
            let mut state = self.state.write();
            for phase in state.group_phases.values_mut() {
                *phase = GroupPhase::Evaluating;
            }
            state.pool_groups.clone()
        };

        let answers = join_all(
            groups
                .iter()
                .map(|group| self.transport.pool_group_members(group)),
        )
        .await;

        let mut members = BTreeSet::new();
        let mut problems = Vec::new();
        for (group, answer) in groups.iter().zip(answers) {
            match answer {
                Ok(pools) => {
                    debug!(group = %group, pools = pools.len(), "Pool group collected");
                    members.extend(pools);
                }
                Err(e) => {
                    warn!(group = %group, error = %e, "Pool group query failed");
                    problems.push(format!("{}: {}", group, e));
                }
            }
        }

        let change = self.control.update_configured_pools(members);
        {
            let mut state = self.state.write();
            for phase in state.group_phases.values_mut() {
                *phase = GroupPhase::Idle;
            }
            state.status = if problems.is_empty() {
                "OK".to_string()
            } else {
                format!("Pool group query failed ({})", problems.join("; "))
            };
        }

        if !change.is_empty() {
            info!(added = ?change.added, removed = ?change.removed, "Configured pools changed");
        }
        self.publish_status();
        Ok(change)
    }

    /// Send gain control to every configured pool: hold time twice the
    /// interval when controlled, zero otherwise
    pub fn send_gain_control(&self) -> Result<usize> {
        let hold = {
            let state = self.state.read();
            if state.controlled {
                state.gain_control_interval * 2
            } else {
                Duration::ZERO
            }
        };
        self.control.send_gain_control(hold.as_millis() as u64)
    }

    /// Hand a timer event to the driver and publish status
    pub fn timer(&self) {
        self.control.dispatch(DriverEvent::Timer);
        self.publish_status();
    }

    /// Ask the loop to send gain control on its next wake-up
    pub fn trigger_gain_control(&self) {
        self.gain_control_requested.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Ask the loop to collect pool groups on its next wake-up
    pub fn trigger_collection(&self) {
        self.collect_requested.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Scheduler loop. Returns when `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(delay = ?self.initial_delay, "Flush scheduler waiting before first evaluation");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_collection: Option<Instant> = None;
        let mut last_gain_control: Option<Instant> = None;
        let mut last_timer: Option<Instant> = None;

        info!("Flush scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            let now = Instant::now();
            let (collection_every, gain_every, timer_every) = {
                let state = self.state.read();
                (
                    state.pool_collection_interval,
                    state.gain_control_interval,
                    state.timer_interval,
                )
            };

            if self.collect_requested.swap(false, Ordering::AcqRel)
                || due(last_collection, collection_every, now)
            {
                last_collection = Some(now);
                match self.refresh().await {
                    Ok(change) if !change.added.is_empty() => {
                        self.gain_control_requested.store(true, Ordering::Release);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Pool collection failed"),
                }
            }

            if self.gain_control_requested.swap(false, Ordering::AcqRel)
                || due(last_gain_control, gain_every, now)
            {
                last_gain_control = Some(now);
                if let Err(e) = self.send_gain_control() {
                    warn!(error = %e, "Gain control failed");
                }
            }

            if due(last_timer, timer_every, now) {
                last_timer = Some(now);
                self.timer();
            }
        }
        info!("Flush scheduler stopped");
    }

    // -------------------------------------------------------------------------
    // Driver lifecycle
    // -------------------------------------------------------------------------

    /// Start the driver defined for `hsm_type`
    pub fn load_driver(&self, hsm_type: &str) -> Result<()> {
        let registration = self.drivers.lookup(hsm_type)?;
        {
            let mut worker = self.worker.lock();
            if let Some(current) = worker.as_ref() {
                return Err(Error::DriverAlreadyLoaded {
                    driver: current.driver_name(),
                });
            }
            *self.driver_properties.write() = DriverProperties::default();
            *worker = Some(DriverWorker::spawn(
                registration,
                self.control.clone(),
                self.driver_properties.clone(),
            ));
        }

        // let a driver loaded into a known setup initialize right away
        if self.control.is_pool_setup_ready() {
            self.control.dispatch(DriverEvent::PoolSetupUpdated);
        }
        self.publish_status();
        Ok(())
    }

    /// Stop the running driver after it drained its queue
    pub async fn unload_driver(&self) -> Result<()> {
        let worker = self.worker.lock().take().ok_or(Error::NoDriverLoaded)?;
        worker.stop(&self.control).await;
        self.publish_status();
        Ok(())
    }

    /// Name of the loaded driver
    pub fn loaded_driver(&self) -> Option<String> {
        self.worker.lock().as_ref().map(DriverWorker::driver_name)
    }

    pub fn is_driver_initialized(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(DriverWorker::is_initialized)
            .unwrap_or(false)
    }

    fn require_driver(&self) -> Result<()> {
        if self.worker.lock().is_some() {
            Ok(())
        } else {
            Err(Error::NoDriverLoaded)
        }
    }

    /// Pass an operator command to the driver and wait for its answer
    pub async fn driver_command(&self, args: DriverArgs) -> Result<String> {
        self.require_driver()?;
        let answer = self.control.command(args)?;
        answer
            .await
            .map_err(|_| Error::Internal("driver worker dropped the command".to_string()))?
    }

    /// Driver details for a storage class (`<storageClass>@<hsm>`)
    pub async fn storage_info_details(&self, storage_class: &str) -> Result<BTreeMap<String, String>> {
        self.require_driver()?;
        let answer = self.control.storage_info(storage_class)?;
        answer
            .await
            .map_err(|_| Error::Internal("driver worker dropped the request".to_string()))?
    }

    /// Offer properties to the driver. The accepted values show up in the
    /// next status snapshot.
    pub fn driver_properties(&self, properties: BTreeMap<String, String>) -> Result<()> {
        self.require_driver()?;
        self.control
            .dispatch(DriverEvent::PropertiesUpdated(properties));
        Ok(())
    }

    pub fn reset_driver(&self) -> Result<()> {
        self.require_driver()?;
        self.control.dispatch(DriverEvent::Reset);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Admin operations
    // -------------------------------------------------------------------------

    pub fn add_pool_groups<I, S>(&self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.state.write();
            for group in groups {
                let group = group.into();
                if !state.pool_groups.contains(&group) {
                    info!(group = %group, "Pool group added");
                    state.group_phases.insert(group.clone(), GroupPhase::Idle);
                    state.pool_groups.push(group);
                }
            }
        }
        self.trigger_collection();
    }

    pub fn remove_pool_groups<I, S>(&self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        {
            let mut state = self.state.write();
            for group in groups {
                let group = group.as_ref();
                state.pool_groups.retain(|g| g != group);
                if state.group_phases.remove(group).is_some() {
                    info!(group = %group, "Pool group removed");
                }
            }
        }
        self.trigger_collection();
    }

    pub fn pool_groups(&self) -> Vec<String> {
        self.state.read().pool_groups.clone()
    }

    pub fn group_phases(&self) -> BTreeMap<String, GroupPhase> {
        self.state.read().group_phases.clone()
    }

    /// Switch control on or off, optionally changing the gain-control
    /// interval (at least 30 s)
    pub fn set_control(&self, controlled: bool, interval: Option<Duration>) -> Result<()> {
        if let Some(interval) = interval {
            if interval < MIN_CONTROL_INTERVAL {
                return Err(Error::InvalidArgument(format!(
                    "control interval must be at least {}s, got {}s",
                    MIN_CONTROL_INTERVAL.as_secs(),
                    interval.as_secs()
                )));
            }
        }
        {
            let mut state = self.state.write();
            state.controlled = controlled;
            if let Some(interval) = interval {
                state.gain_control_interval = interval;
            }
        }
        self.control.set_controlled(controlled);
        info!(controlled, interval = ?interval, "Flush control changed");
        self.trigger_gain_control();
        Ok(())
    }

    pub fn is_controlled(&self) -> bool {
        self.control.is_controlled()
    }

    pub fn set_timer_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument("timer interval must not be zero".to_string()));
        }
        self.state.write().timer_interval = interval;
        Ok(())
    }

    pub fn set_pool_mode(&self, pool: &str, read_only: bool) -> Result<()> {
        self.pool(pool)?.set_read_only(read_only)
    }

    pub fn query_pool_mode(&self, pool: &str) -> Result<()> {
        self.pool(pool)?.query_mode()
    }

    /// Flush `count` files (0 = all) of `storage_class` (`<class>@<hsm>`)
    /// on `pool`
    pub fn flush_pool(&self, pool: &str, storage_class: &str, count: u32) -> Result<()> {
        let info = self
            .pool(pool)?
            .flush_info(storage_class)
            .ok_or_else(|| Error::StorageClassNotFound {
                pool: pool.to_string(),
                storage_class: storage_class.to_string(),
            })?;
        info.flush(count)
    }

    pub fn list_pools(&self) -> Vec<PoolDetails> {
        self.control
            .configured_pools()
            .iter()
            .map(|pool| pool.details())
            .collect()
    }

    pub fn pool_details(&self, pool: &str) -> Result<PoolDetails> {
        Ok(self.pool(pool)?.details())
    }

    fn pool(&self, pool: &str) -> Result<crate::flush::Pool> {
        self.control
            .pool_by_name(pool)
            .ok_or_else(|| Error::PoolNotFound {
                pool: pool.to_string(),
            })
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// A fresh snapshot
    pub fn cell_info(&self) -> FlushControlCellInfo {
        let (driver_name, hsm_type) = match self.worker.lock().as_ref() {
            Some(worker) => (
                Some(worker.driver_name()),
                Some(worker.registration().hsm_type.clone()),
            ),
            None => (None, None),
        };
        let properties = self.driver_properties.read().clone();
        let now = Utc::now();
        let state = self.state.read();

        FlushControlCellInfo {
            cell_name: self.cell_name.clone(),
            driver_name,
            hsm_type,
            update_interval_secs: state.gain_control_interval.as_secs(),
            is_controlled: state.controlled,
            pool_groups: state.pool_groups.clone(),
            group_phases: state.group_phases.clone(),
            configured_pools: self.control.configured_pool_names().len(),
            status: state.status.clone(),
            driver_properties: properties
                .values
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
            driver_properties_age: properties
                .updated_at
                .and_then(|at| (now - at).to_std().ok()),
            driver_properties_updated: properties.updated_at,
            produced_at: now,
            requests: self.control.requests(),
            failed: self.control.failed(),
        }
    }

    /// Build a snapshot and publish it to subscribers
    pub fn publish_status(&self) {
        let info = self.cell_info();
        debug!(status = %info, "Status published");
        self.status_tx.send_replace(info);
    }

    pub fn subscribe_status(&self) -> watch::Receiver<FlushControlCellInfo> {
        self.status_tx.subscribe()
    }

    /// Unload the driver and stop the request dispatcher
    pub async fn shutdown(&self) {
        match self.unload_driver().await {
            Ok(()) | Err(Error::NoDriverLoaded) => {}
            Err(e) => warn!(error = %e, "Driver unload failed"),
        }
        self.dispatcher_cancel.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "Request dispatcher ended abnormally");
            }
        }
        info!(cell = %self.cell_name, "Flush scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use assert_matches::assert_matches;

    fn scheduler(transport: Arc<LoopbackTransport>) -> Arc<FlushScheduler> {
        let config = SchedulerConfig {
            pool_groups: vec!["writers".into()],
            ..Default::default()
        };
        FlushScheduler::new(
            config,
            transport,
            Arc::new(DriverRegistry::with_builtin_drivers()),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_collects_groups() {
        let transport = LoopbackTransport::new();
        transport.add_pool("pool-a", &["writers"]);
        transport.add_pool("pool-b", &["writers"]);
        transport.add_pool("pool-c", &["readers"]);
        let scheduler = scheduler(transport.clone());
        let mut status = scheduler.subscribe_status();

        let change = scheduler.refresh().await.unwrap();
        assert_eq!(change.added, vec!["pool-a", "pool-b"]);
        assert!(status.has_changed().unwrap());
        let info = status.borrow_and_update().clone();
        assert_eq!(info.configured_pools, 2);
        assert_eq!(info.status, "OK");
        assert_eq!(info.group_phases["writers"], GroupPhase::Idle);

        scheduler.add_pool_groups(["readers"]);
        let change = scheduler.refresh().await.unwrap();
        assert_eq!(change.added, vec!["pool-c"]);

        scheduler.remove_pool_groups(["writers"]);
        let change = scheduler.refresh().await.unwrap();
        assert_eq!(change.removed, vec!["pool-a", "pool-b"]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_group_query() {
        let transport = LoopbackTransport::new();
        transport.add_pool("pool-a", &["writers"]);
        let scheduler = scheduler(transport.clone());
        scheduler.add_pool_groups(["missing"]);

        let change = scheduler.refresh().await.unwrap();
        assert_eq!(change.added, vec!["pool-a"]);
        assert!(scheduler.cell_info().status.contains("missing"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_control_rejects_short_interval() {
        let scheduler = scheduler(LoopbackTransport::new());
        assert_matches!(
            scheduler.set_control(true, Some(Duration::from_secs(10))),
            Err(Error::InvalidArgument(_))
        );

        scheduler.set_control(false, Some(Duration::from_secs(45))).unwrap();
        let info = scheduler.cell_info();
        assert!(!info.is_controlled);
        assert_eq!(info.update_interval_secs, 45);
        assert!(!scheduler.control().is_controlled());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_admin_lookups() {
        let transport = LoopbackTransport::new();
        transport.add_pool("pool-a", &["writers"]);
        let scheduler = scheduler(transport);
        scheduler.refresh().await.unwrap();

        assert_matches!(scheduler.pool_details("nope"), Err(Error::PoolNotFound { .. }));
        assert_matches!(
            scheduler.flush_pool("pool-a", "raw@osm", 0),
            Err(Error::StorageClassNotFound { .. })
        );
        assert_eq!(scheduler.list_pools().len(), 1);
        assert_eq!(scheduler.pool_details("pool-a").unwrap().mode, "UU");

        assert_matches!(scheduler.reset_driver(), Err(Error::NoDriverLoaded));
        assert_matches!(
            scheduler.storage_info_details("raw@osm").await,
            Err(Error::NoDriverLoaded)
        );
        assert_matches!(scheduler.unload_driver().await, Err(Error::NoDriverLoaded));
        assert_matches!(scheduler.load_driver("tsm"), Err(Error::DriverNotFound { .. }));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_interval_validated_at_creation() {
        let config = SchedulerConfig {
            gain_control_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let result = FlushScheduler::new(
            config,
            LoopbackTransport::new(),
            Arc::new(DriverRegistry::new()),
            None,
        );
        assert_matches!(result, Err(Error::Configuration(_)));
    }

    #[test]
    fn test_due() {
        let now = Instant::now();
        assert!(due(None, Duration::from_secs(60), now));
        assert!(!due(Some(now), Duration::from_secs(60), now));
        assert!(due(Some(now), Duration::ZERO, now));
    }
}
