//! Flush Control Core
//!
//! Shared state behind the driver-facing façade: the configured pool set,
//! reply application and event delivery to the driver worker.

use super::events::{DriverEvent, DriverMessage, FlushOutcome, FlushOutcomeKind, IoModeResult};
use super::pool::{CoreLink, Pool, PoolRequest};
use crate::attraction::AttractionRegistry;
use crate::domain::ports::{PoolCommand, PoolReply, ReplySink, TransportAddress};
use crate::driver::args::DriverArgs;
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::FlushMetrics;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Error code recorded when a flush request never reached its pool
pub const TRANSPORT_FAILURE_CODE: i32 = -1;

// =============================================================================
// Driver-Facing Trait
// =============================================================================

/// What a loaded driver may ask of the core
pub trait FlushControlCore: Send + Sync {
    fn pool_by_name(&self, name: &str) -> Option<Pool>;

    /// Names of the pools this driver is responsible for
    fn configured_pool_names(&self) -> BTreeSet<String>;

    /// Handles of the configured pools, ordered by name
    fn configured_pools(&self) -> Vec<Pool>;

    /// Arguments supplied when the driver was loaded
    fn driver_args(&self) -> DriverArgs;

    /// Whether mutating calls (`set_read_only`, `flush`) are permitted
    fn is_controlled(&self) -> bool;
}

// =============================================================================
// Dispatcher Inputs
// =============================================================================

/// Receiving ends consumed by the request dispatcher
#[derive(Debug)]
pub(crate) struct DispatchInputs {
    pub requests: mpsc::UnboundedReceiver<PoolRequest>,
    pub replies: mpsc::UnboundedReceiver<PoolReply>,
}

/// Changes made by a pool set update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSetChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PoolSetChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// Flush Control
// =============================================================================

/// Shared flush control state
pub struct FlushControl {
    pools: RwLock<BTreeMap<String, Pool>>,
    link: Arc<CoreLink>,
    setup_ready: AtomicBool,
    driver_args: RwLock<DriverArgs>,
    driver: RwLock<Option<mpsc::UnboundedSender<DriverMessage>>>,
    attractions: Option<Arc<AttractionRegistry>>,
    reply_sink: ReplySink,
    requests: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for FlushControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushControl")
            .field("pools", &self.pools.read().keys().collect::<Vec<_>>())
            .field("controlled", &self.link.is_controlled())
            .field("setup_ready", &self.is_pool_setup_ready())
            .field("driver_attached", &self.has_driver())
            .finish()
    }
}

impl FlushControl {
    /// Create the core. Pool addresses are resolved through `attractions`
    /// when given, otherwise the pool name is the address.
    pub(crate) fn new(
        metrics: FlushMetrics,
        attractions: Option<Arc<AttractionRegistry>>,
    ) -> (Arc<Self>, DispatchInputs) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let control = Arc::new(Self {
            pools: RwLock::new(BTreeMap::new()),
            link: Arc::new(CoreLink::new(request_tx, metrics)),
            setup_ready: AtomicBool::new(false),
            driver_args: RwLock::new(DriverArgs::default()),
            driver: RwLock::new(None),
            attractions,
            reply_sink: reply_tx,
            requests: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        (
            control,
            DispatchInputs {
                requests: request_rx,
                replies: reply_rx,
            },
        )
    }

    pub fn metrics(&self) -> &FlushMetrics {
        &self.link.metrics
    }

    /// Sender for unsolicited replies (flush completion)
    pub fn reply_sink(&self) -> ReplySink {
        self.reply_sink.clone()
    }

    pub fn set_controlled(&self, controlled: bool) {
        self.link.set_controlled(controlled);
    }

    pub(crate) fn set_driver_args(&self, args: DriverArgs) {
        *self.driver_args.write() = args;
    }

    /// Replies applied so far
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Replies or requests that could not be applied
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Pool set
    // -------------------------------------------------------------------------

    fn resolve_address(&self, pool: &str) -> TransportAddress {
        self.attractions
            .as_ref()
            .and_then(|registry| registry.pool_path(pool).ok())
            .unwrap_or_else(|| TransportAddress::new(pool))
    }

    /// Replace the configured pool set, keeping handles of pools that stay.
    /// Emits added/removed events followed by `PoolSetupUpdated`.
    pub fn update_configured_pools(&self, names: BTreeSet<String>) -> PoolSetChange {
        let mut change = PoolSetChange::default();
        {
            let mut pools = self.pools.write();

            pools.retain(|name, _| {
                let keep = names.contains(name);
                if !keep {
                    change.removed.push(name.clone());
                }
                keep
            });

            for name in names {
                if !pools.contains_key(&name) {
                    let address = self.resolve_address(&name);
                    pools.insert(name.clone(), Pool::new(name.clone(), address, self.link.clone()));
                    change.added.push(name);
                }
            }

            self.link.metrics.configured_pools.set(pools.len() as i64);
        }

        for pool in &change.removed {
            info!(pool = %pool, "Pool removed from flush control");
            self.dispatch(DriverEvent::ConfiguredPoolRemoved { pool: pool.clone() });
        }
        for pool in &change.added {
            info!(pool = %pool, "Pool added to flush control");
            self.dispatch(DriverEvent::ConfiguredPoolAdded { pool: pool.clone() });
        }

        self.setup_ready.store(true, Ordering::Release);
        self.dispatch(DriverEvent::PoolSetupUpdated);
        change
    }

    /// True once the pool group membership was collected at least once
    pub fn is_pool_setup_ready(&self) -> bool {
        self.setup_ready.load(Ordering::Acquire)
    }

    /// True when every configured pool answered at least once, or some pool
    /// answered twice
    pub fn is_pool_config_done(&self) -> bool {
        let pools = self.pools.read();
        let mut all_answered = true;
        for pool in pools.values() {
            let answers = pool.answer_count();
            if answers > 1 {
                return true;
            }
            if answers == 0 {
                all_answered = false;
            }
        }
        all_answered
    }

    /// Ask every configured pool for its I/O mode
    pub fn query_all_pool_modes(&self) -> Result<()> {
        for pool in self.configured_pools() {
            pool.query_mode()?;
        }
        Ok(())
    }

    /// Send a gain-control request to every configured pool. Returns the
    /// number of requests issued.
    pub fn send_gain_control(&self, hold_millis: u64) -> Result<usize> {
        let pools = self.configured_pools();
        for pool in &pools {
            self.link
                .submit(PoolRequest::new(pool, PoolCommand::GainControl { hold_millis }))?;
        }
        debug!(pools = pools.len(), hold_millis, "Gain control sent");
        Ok(pools.len())
    }

    // -------------------------------------------------------------------------
    // Driver channel
    // -------------------------------------------------------------------------

    pub(crate) fn attach_driver(&self, sender: mpsc::UnboundedSender<DriverMessage>) {
        *self.driver.write() = Some(sender);
    }

    pub(crate) fn detach_driver(&self) -> Option<mpsc::UnboundedSender<DriverMessage>> {
        self.driver.write().take()
    }

    pub fn has_driver(&self) -> bool {
        self.driver.read().is_some()
    }

    /// Deliver an event to the driver worker; dropped when none is loaded
    pub fn dispatch(&self, event: DriverEvent) {
        let driver = self.driver.read();
        match driver.as_ref() {
            Some(sender) => {
                if sender.send(DriverMessage::Event(event)).is_err() {
                    debug!("Driver worker has stopped, event dropped");
                }
            }
            None => debug!(event = event.kind(), "No driver loaded, event dropped"),
        }
    }

    /// Hand an operator command to the driver and get a receiver for its
    /// answer
    pub(crate) fn command(&self, args: DriverArgs) -> Result<oneshot::Receiver<Result<String>>> {
        let (respond_to, response) = oneshot::channel();
        let driver = self.driver.read();
        let sender = driver.as_ref().ok_or(Error::NoDriverLoaded)?;
        sender
            .send(DriverMessage::Command { args, respond_to })
            .map_err(|_| Error::NoDriverLoaded)?;
        Ok(response)
    }

    /// Ask the driver what it knows about a storage class
    pub(crate) fn storage_info(
        &self,
        storage_class: &str,
    ) -> Result<oneshot::Receiver<Result<BTreeMap<String, String>>>> {
        let (respond_to, response) = oneshot::channel();
        let driver = self.driver.read();
        let sender = driver.as_ref().ok_or(Error::NoDriverLoaded)?;
        sender
            .send(DriverMessage::StorageInfo {
                storage_class: storage_class.to_string(),
                respond_to,
            })
            .map_err(|_| Error::NoDriverLoaded)?;
        Ok(response)
    }

    // -------------------------------------------------------------------------
    // Replies
    // -------------------------------------------------------------------------

    fn stale(&self, pool: &str, what: &str) -> Error {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.link.metrics.stale_replies.inc();
        warn!(pool = %pool, reply = what, "Reply for a pool that is no longer configured, discarded");
        Error::StaleReply {
            pool: pool.to_string(),
            reply: what.to_string(),
        }
    }

    /// Apply a reply to the pool it names and notify the driver
    pub fn handle_reply(&self, reply: PoolReply) -> Result<()> {
        let pool = self
            .pool_by_name(reply.pool())
            .ok_or_else(|| self.stale(reply.pool(), reply.kind()))?;
        self.apply_reply(&pool, reply)
    }

    /// Apply the answer to `request`. The answer is discarded when the pool
    /// that issued the request was removed in the meantime, even if a pool
    /// of the same name was configured again.
    pub(crate) fn handle_request_reply(&self, request: &PoolRequest, reply: PoolReply) -> Result<()> {
        match self.pool_by_name(reply.pool()) {
            Some(pool) if pool.ptr_eq(&request.origin) => self.apply_reply(&pool, reply),
            _ => Err(self.stale(reply.pool(), reply.kind())),
        }
    }

    fn apply_reply(&self, pool: &Pool, reply: PoolReply) -> Result<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.link
            .metrics
            .replies
            .with_label_values(&[reply.kind()])
            .inc();

        match reply {
            PoolReply::PoolMode { pool: name, mode } => {
                pool.apply_mode(mode);
                debug!(pool = %name, mode = %mode, "Pool mode updated");
                self.dispatch(DriverEvent::IoMode(IoModeResult { pool: name, mode }));
            }
            PoolReply::FlushControlInfo {
                pool: name,
                cell_info,
                flush_infos,
            } => {
                pool.apply_flush_control_info(cell_info, flush_infos);
                self.dispatch(DriverEvent::PoolFlushInfoUpdated { pool: name });
            }
            PoolReply::Unreachable { pool: name } => {
                warn!(pool = %name, "Pool unreachable, marked inactive");
                pool.mark_unreachable();
                self.dispatch(DriverEvent::PoolFlushInfoUpdated { pool: name });
            }
            PoolReply::FlushAck {
                pool: name,
                storage_class,
                flush_id,
            } => {
                let (applied, known) =
                    pool.with_flush_state(&storage_class, |s| s.set_acknowledged(flush_id));
                if !known {
                    warn!(pool = %name, storage_class = %storage_class, "Flush acknowledged for unknown storage class");
                } else if !applied {
                    debug!(pool = %name, storage_class = %storage_class, flush_id, "Late flush acknowledgement ignored");
                } else {
                    debug!(pool = %name, storage_class = %storage_class, flush_id, "Flush acknowledged");
                    self.dispatch(DriverEvent::Flush(FlushOutcome {
                        pool: name,
                        storage_class,
                        kind: FlushOutcomeKind::Acknowledged { flush_id },
                    }));
                }
            }
            PoolReply::FlushFinished {
                pool: name,
                storage_class,
                cell_info,
                flush_infos,
            } => {
                pool.apply_flush_control_info(cell_info, flush_infos);
                let (_, known) = pool.with_flush_state(&storage_class, |s| s.set_done());
                if !known {
                    warn!(pool = %name, storage_class = %storage_class, "Flush finished for storage class the pool no longer reports");
                }
                info!(pool = %name, storage_class = %storage_class, "Flush finished");
                self.dispatch(DriverEvent::Flush(FlushOutcome {
                    pool: name,
                    storage_class,
                    kind: FlushOutcomeKind::Done,
                }));
            }
            PoolReply::FlushFailed {
                pool: _,
                storage_class,
                error_code,
                message,
            } => {
                self.flush_failed(pool, storage_class, error_code, message);
            }
            PoolReply::Ok { .. } => {}
        }
        Ok(())
    }

    fn flush_failed(&self, pool: &Pool, storage_class: String, error_code: i32, message: String) {
        let (_, known) = pool.with_flush_state(&storage_class, |s| {
            s.set_failed(error_code, Some(message.clone()))
        });
        self.link.metrics.flush_failures.inc();
        warn!(
            pool = %pool.name(),
            storage_class = %storage_class,
            error_code,
            known,
            "Flush failed: {}",
            message
        );
        self.dispatch(DriverEvent::Flush(FlushOutcome {
            pool: pool.name().to_string(),
            storage_class,
            kind: FlushOutcomeKind::Failed {
                error_code,
                message,
            },
        }));
    }

    /// A request could not be delivered. Gain control and flush failures
    /// are reported to the driver; mode requests are picked up again on the
    /// next pass.
    pub(crate) fn handle_request_failure(&self, request: &PoolRequest, error: &Error) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.link
            .metrics
            .request_failures
            .with_label_values(&[request.command.kind()])
            .inc();

        let pool = match self.pool_by_name(&request.pool) {
            Some(pool) if pool.ptr_eq(&request.origin) => pool,
            _ => {
                debug!(pool = %request.pool, error = %error, "Request failed for pool no longer configured");
                return;
            }
        };

        match error.action() {
            ErrorAction::RetryNextTick => {
                warn!(pool = %request.pool, command = request.command.kind(), error = %error, "Request not delivered")
            }
            ErrorAction::Discard => {
                debug!(pool = %request.pool, command = request.command.kind(), error = %error, "Request discarded")
            }
            ErrorAction::Fail => {
                error!(pool = %request.pool, command = request.command.kind(), error = %error, "Request failed")
            }
        }

        match &request.command {
            PoolCommand::GainControl { .. } => {
                info!(pool = %request.pool, "Gain control not delivered, pool marked inactive");
                pool.mark_unreachable();
                self.dispatch(DriverEvent::PoolFlushInfoUpdated {
                    pool: request.pool.clone(),
                });
            }
            PoolCommand::Flush { storage_class, .. } => {
                self.flush_failed(
                    &pool,
                    storage_class.clone(),
                    TRANSPORT_FAILURE_CODE,
                    error.to_string(),
                );
            }
            PoolCommand::QueryMode | PoolCommand::SetMode { .. } => {}
        }
    }
}

impl FlushControlCore for FlushControl {
    fn pool_by_name(&self, name: &str) -> Option<Pool> {
        self.pools.read().get(name).cloned()
    }

    fn configured_pool_names(&self) -> BTreeSet<String> {
        self.pools.read().keys().cloned().collect()
    }

    fn configured_pools(&self) -> Vec<Pool> {
        self.pools.read().values().cloned().collect()
    }

    fn driver_args(&self) -> DriverArgs {
        self.driver_args.read().clone()
    }

    fn is_controlled(&self) -> bool {
        self.link.is_controlled()
    }
}
