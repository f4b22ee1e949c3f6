//! Pool and FlushInfo handles
//!
//! Driver-facing views of a configured pool. Handles are cheap to clone and
//! share the pool's state; mutating operations enqueue a request for the
//! transport and return immediately.

use crate::domain::ports::{
    PoolCellInfo, PoolCommand, PoolMode, StorageClassFlushInfo, TransportAddress,
};
use crate::error::{Error, Result};
use crate::metrics::FlushMetrics;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

// =============================================================================
// Requests
// =============================================================================

/// A command on its way to a pool
#[derive(Debug, Clone)]
pub(crate) struct PoolRequest {
    pub pool: String,
    pub address: TransportAddress,
    pub command: PoolCommand,
    /// The configured pool instance that issued the request. Its answer is
    /// only applied while this instance is still configured.
    pub origin: Pool,
}

impl PoolRequest {
    pub(crate) fn new(origin: &Pool, command: PoolCommand) -> Self {
        Self {
            pool: origin.name().to_string(),
            address: origin.address().clone(),
            command,
            origin: origin.clone(),
        }
    }
}

/// What every pool handle needs from the core to issue requests
#[derive(Debug)]
pub(crate) struct CoreLink {
    requests: mpsc::UnboundedSender<PoolRequest>,
    controlled: AtomicBool,
    pub(crate) metrics: FlushMetrics,
}

impl CoreLink {
    pub(crate) fn new(requests: mpsc::UnboundedSender<PoolRequest>, metrics: FlushMetrics) -> Self {
        Self {
            requests,
            controlled: AtomicBool::new(true),
            metrics,
        }
    }

    pub(crate) fn is_controlled(&self) -> bool {
        self.controlled.load(Ordering::Acquire)
    }

    pub(crate) fn set_controlled(&self, controlled: bool) {
        self.controlled.store(controlled, Ordering::Release);
    }

    pub(crate) fn submit(&self, request: PoolRequest) -> Result<()> {
        self.metrics
            .requests
            .with_label_values(&[request.command.kind()])
            .inc();
        self.requests
            .send(request)
            .map_err(|_| Error::Internal("request dispatcher has stopped".to_string()))
    }

    fn require_control(&self, pool: &str, operation: &str) -> Result<()> {
        if self.is_controlled() {
            Ok(())
        } else {
            Err(Error::ControlDisabled {
                pool: pool.to_string(),
                operation: operation.to_string(),
            })
        }
    }
}

// =============================================================================
// Flush Bookkeeping
// =============================================================================

/// Per storage class flush state kept by the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlushState {
    pub stats: StorageClassFlushInfo,
    pub previous: Option<StorageClassFlushInfo>,
    pub flushing_requested: bool,
    pub flushing_pending: bool,
    pub flushing_error: i32,
    pub flushing_error_message: Option<String>,
    pub flush_id: u64,
}

impl FlushState {
    pub(crate) fn new(stats: StorageClassFlushInfo) -> Self {
        Self {
            stats,
            previous: None,
            flushing_requested: false,
            flushing_pending: false,
            flushing_error: 0,
            flushing_error_message: None,
            flush_id: 0,
        }
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.flushing_requested || self.flushing_pending
    }

    pub(crate) fn update_stats(&mut self, stats: StorageClassFlushInfo) {
        self.previous = Some(std::mem::replace(&mut self.stats, stats));
    }

    pub(crate) fn set_requested(&mut self) {
        self.flushing_requested = true;
        self.flushing_pending = false;
        self.flushing_error = 0;
        self.flushing_error_message = None;
    }

    /// Record the pool's acknowledgement. Only a flush that is still
    /// requested can be acknowledged; a late ack after the flush already
    /// finished or failed is ignored and `false` is returned.
    pub(crate) fn set_acknowledged(&mut self, flush_id: u64) -> bool {
        if !self.flushing_requested {
            return false;
        }
        self.flushing_pending = true;
        self.flush_id = flush_id;
        true
    }

    pub(crate) fn set_failed(&mut self, error_code: i32, message: Option<String>) {
        self.flushing_requested = false;
        self.flushing_pending = false;
        self.flush_id = 0;
        self.flushing_error = error_code;
        self.flushing_error_message = message;
    }

    pub(crate) fn set_done(&mut self) {
        self.set_failed(0, None);
    }

    fn details(&self, name: &str) -> FlushInfoDetails {
        FlushInfoDetails {
            name: name.to_string(),
            is_flushing: self.is_flushing(),
            flushing_error: self.flushing_error,
            flushing_error_message: self.flushing_error_message.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// Snapshot of one storage class on one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushInfoDetails {
    /// `<storageClass>@<hsm>`
    pub name: String,
    pub is_flushing: bool,
    /// Error code of the last failed flush, 0 if none
    pub flushing_error: i32,
    pub flushing_error_message: Option<String>,
    pub stats: StorageClassFlushInfo,
}

// =============================================================================
// Pool State
// =============================================================================

/// Derived life-cycle phase of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolPhase {
    /// No I/O mode answer yet
    QueryingIoMode,
    /// I/O mode known, nothing being flushed
    Known,
    /// A flush was sent and not yet acknowledged
    FlushRequested,
    /// The pool acknowledged a flush that has not finished
    Flushing,
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolPhase::QueryingIoMode => "QueryingIoMode",
            PoolPhase::Known => "Known",
            PoolPhase::FlushRequested => "FlushRequested",
            PoolPhase::Flushing => "Flushing",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    cell_info: Option<PoolCellInfo>,
    mode: PoolMode,
    is_active: bool,
    last_updated: Option<DateTime<Utc>>,
    answer_count: u64,
    flush_infos: IndexMap<String, FlushState>,
}

/// Snapshot of a pool for status output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDetails {
    pub name: String,
    pub address: TransportAddress,
    pub is_active: bool,
    pub is_read_only: bool,
    pub io_mode_known: bool,
    pub mode: String,
    pub phase: PoolPhase,
    pub cell_info: Option<PoolCellInfo>,
    pub flush_infos: Vec<FlushInfoDetails>,
    pub last_updated: Option<DateTime<Utc>>,
    pub answer_count: u64,
}

// =============================================================================
// Pool Handle
// =============================================================================

struct PoolInner {
    name: String,
    address: TransportAddress,
    state: RwLock<PoolState>,
    driver_handle: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    link: Arc<CoreLink>,
}

/// Handle to a configured pool
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("address", &self.inner.address)
            .field("mode", &state.mode.to_string())
            .field("is_active", &state.is_active)
            .field("answer_count", &state.answer_count)
            .finish()
    }
}

impl Pool {
    pub(crate) fn new(
        name: impl Into<String>,
        address: TransportAddress,
        link: Arc<CoreLink>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                address,
                state: RwLock::new(PoolState::default()),
                driver_handle: Mutex::new(None),
                link,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> &TransportAddress {
        &self.inner.address
    }

    /// True once the pool answered a gain-control request, false after an
    /// undeliverable one
    pub fn is_active(&self) -> bool {
        self.inner.state.read().is_active
    }

    /// Reports `true` while the mode is still unknown
    pub fn is_read_only(&self) -> bool {
        self.inner.state.read().mode.is_read_only()
    }

    pub fn is_io_mode_known(&self) -> bool {
        self.inner.state.read().mode.is_known()
    }

    pub fn mode(&self) -> PoolMode {
        self.inner.state.read().mode
    }

    /// `UU`, `R-` or `RW`
    pub fn mode_string(&self) -> String {
        self.mode().to_string()
    }

    pub fn cell_info(&self) -> Option<PoolCellInfo> {
        self.inner.state.read().cell_info.clone()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().last_updated
    }

    /// Gain-control answers (including undeliverable ones) seen so far
    pub fn answer_count(&self) -> u64 {
        self.inner.state.read().answer_count
    }

    /// Names (`<storageClass>@<hsm>`) of the storage classes the pool reported
    pub fn storage_class_names(&self) -> BTreeSet<String> {
        self.inner.state.read().flush_infos.keys().cloned().collect()
    }

    pub fn flush_infos(&self) -> Vec<FlushInfoDetails> {
        self.inner
            .state
            .read()
            .flush_infos
            .iter()
            .map(|(name, state)| state.details(name))
            .collect()
    }

    /// Handle for one storage class, `None` if the pool does not report it
    pub fn flush_info(&self, name: &str) -> Option<FlushInfo> {
        if self.inner.state.read().flush_infos.contains_key(name) {
            Some(FlushInfo {
                pool: self.clone(),
                name: name.to_string(),
            })
        } else {
            None
        }
    }

    /// Handles for every storage class the pool reported
    pub fn flush_info_handles(&self) -> Vec<FlushInfo> {
        self.inner
            .state
            .read()
            .flush_infos
            .keys()
            .map(|name| FlushInfo {
                pool: self.clone(),
                name: name.clone(),
            })
            .collect()
    }

    pub fn phase(&self) -> PoolPhase {
        let state = self.inner.state.read();
        if !state.mode.is_known() {
            PoolPhase::QueryingIoMode
        } else if state.flush_infos.values().any(|f| f.flushing_pending) {
            PoolPhase::Flushing
        } else if state.flush_infos.values().any(|f| f.flushing_requested) {
            PoolPhase::FlushRequested
        } else {
            PoolPhase::Known
        }
    }

    pub fn details(&self) -> PoolDetails {
        let phase = self.phase();
        let state = self.inner.state.read();
        PoolDetails {
            name: self.inner.name.clone(),
            address: self.inner.address.clone(),
            is_active: state.is_active,
            is_read_only: state.mode.is_read_only(),
            io_mode_known: state.mode.is_known(),
            mode: state.mode.to_string(),
            phase,
            cell_info: state.cell_info.clone(),
            flush_infos: state
                .flush_infos
                .iter()
                .map(|(name, s)| s.details(name))
                .collect(),
            last_updated: state.last_updated,
            answer_count: state.answer_count,
        }
    }

    /// Ask the pool for its I/O mode. Allowed without control.
    pub fn query_mode(&self) -> Result<()> {
        self.inner
            .link
            .submit(PoolRequest::new(self, PoolCommand::QueryMode))
    }

    /// Request a mode change. The new mode is observed through a later
    /// I/O mode event.
    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.inner
            .link
            .require_control(&self.inner.name, "set_read_only")?;
        self.inner
            .link
            .submit(PoolRequest::new(self, PoolCommand::SetMode { read_only }))
    }

    /// Attach driver-owned state to this pool. Only a weak reference is
    /// kept.
    pub fn set_driver_handle<T: Any + Send + Sync>(&self, handle: &Arc<T>) {
        let handle: Arc<dyn Any + Send + Sync> = handle.clone();
        *self.inner.driver_handle.lock() = Some(Arc::downgrade(&handle));
    }

    pub fn clear_driver_handle(&self) {
        *self.inner.driver_handle.lock() = None;
    }

    /// The attached handle, if it is still alive
    pub fn driver_handle(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.driver_handle.lock().as_ref()?.upgrade()
    }

    /// The attached handle downcast to the driver's type
    pub fn driver_handle_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.driver_handle()?.downcast::<T>().ok()
    }

    /// Pointer identity check against the attached handle
    pub fn same_driver_handle<T: Any + Send + Sync>(&self, handle: &Arc<T>) -> bool {
        match self.driver_handle() {
            Some(current) => {
                Arc::as_ptr(&current) as *const () == Arc::as_ptr(handle) as *const ()
            }
            None => false,
        }
    }

    /// Two handles for the same configured pool instance
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // -------------------------------------------------------------------------
    // Reply application (core only)
    // -------------------------------------------------------------------------

    pub(crate) fn apply_mode(&self, mode: PoolMode) {
        self.inner.state.write().mode = mode;
    }

    /// Replace cell info and flush infos from a gain-control style answer.
    /// Bookkeeping survives for classes that are still reported.
    pub(crate) fn apply_flush_control_info(
        &self,
        cell_info: PoolCellInfo,
        flush_infos: Vec<StorageClassFlushInfo>,
    ) {
        let mut state = self.inner.state.write();
        let mut previous = std::mem::take(&mut state.flush_infos);
        let mut updated = IndexMap::with_capacity(flush_infos.len());

        for stats in flush_infos {
            let name = stats.full_name();
            let entry = match previous.swap_remove(&name) {
                Some(mut existing) => {
                    existing.update_stats(stats);
                    existing
                }
                None => FlushState::new(stats),
            };
            updated.insert(name, entry);
        }

        state.cell_info = Some(cell_info);
        state.flush_infos = updated;
        state.is_active = true;
        state.last_updated = Some(Utc::now());
        state.answer_count += 1;
    }

    pub(crate) fn mark_unreachable(&self) {
        let mut state = self.inner.state.write();
        state.is_active = false;
        state.last_updated = Some(Utc::now());
        state.answer_count += 1;
    }

    /// Run `f` on the bookkeeping of `name`. Unknown classes get a temporary
    /// record that is dropped afterwards; the second value reports whether
    /// the record was real.
    pub(crate) fn with_flush_state<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FlushState) -> R,
    ) -> (R, bool) {
        let mut state = self.inner.state.write();
        match state.flush_infos.get_mut(name) {
            Some(existing) => (f(existing), true),
            None => {
                let (class, hsm) = split_class_name(name);
                let mut temporary = FlushState::new(StorageClassFlushInfo::new(hsm, class));
                (f(&mut temporary), false)
            }
        }
    }

    fn link(&self) -> &CoreLink {
        &self.inner.link
    }
}

/// Split `<storageClass>@<hsm>`; a name without `@` is all storage class
pub(crate) fn split_class_name(name: &str) -> (&str, &str) {
    name.rsplit_once('@').unwrap_or((name, ""))
}

// =============================================================================
// FlushInfo Handle
// =============================================================================

/// Handle for one storage class on one pool
#[derive(Clone, Debug)]
pub struct FlushInfo {
    pool: Pool,
    name: String,
}

impl FlushInfo {
    /// `<storageClass>@<hsm>`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Snapshot, `None` once the pool stopped reporting the class
    pub fn details(&self) -> Option<FlushInfoDetails> {
        self.pool
            .inner
            .state
            .read()
            .flush_infos
            .get(&self.name)
            .map(|s| s.details(&self.name))
    }

    pub fn stats(&self) -> Option<StorageClassFlushInfo> {
        self.details().map(|d| d.stats)
    }

    pub fn is_flushing(&self) -> bool {
        self.pool
            .inner
            .state
            .read()
            .flush_infos
            .get(&self.name)
            .map(FlushState::is_flushing)
            .unwrap_or(false)
    }

    /// Ask the pool to flush `count` precious files of this class, `0`
    /// meaning all of them.
    pub fn flush(&self, count: u32) -> Result<()> {
        let link = self.pool.link();
        link.require_control(self.pool.name(), "flush")?;

        let mut state = self.pool.inner.state.write();
        let entry = state.flush_infos.get_mut(&self.name).ok_or_else(|| {
            Error::Driver(format!(
                "storage class {} is not known to pool {}",
                self.name,
                self.pool.name()
            ))
        })?;

        link.submit(PoolRequest::new(
            &self.pool,
            PoolCommand::Flush {
                storage_class: self.name.clone(),
                count,
            },
        ))?;
        entry.set_requested();
        link.metrics.flush_requests.inc();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    pub(crate) fn test_link() -> (Arc<CoreLink>, mpsc::UnboundedReceiver<PoolRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = FlushMetrics::new().unwrap();
        (Arc::new(CoreLink::new(tx, metrics)), rx)
    }

    fn class(hsm: &str, name: &str, pending: u32) -> StorageClassFlushInfo {
        StorageClassFlushInfo {
            request_count: pending,
            ..StorageClassFlushInfo::new(hsm, name)
        }
    }

    #[test]
    fn test_unknown_mode_is_stable() {
        let (link, _rx) = test_link();
        let pool = Pool::new("pool-a", "pool-a".into(), link);

        assert!(!pool.is_io_mode_known());
        assert!(pool.is_read_only());
        assert!(pool.is_read_only());
        assert_eq!(pool.mode_string(), "UU");
        assert_eq!(pool.phase(), PoolPhase::QueryingIoMode);

        pool.apply_mode(PoolMode::from_read_only(false));
        assert!(pool.is_io_mode_known());
        assert!(!pool.is_read_only());
        assert_eq!(pool.phase(), PoolPhase::Known);
    }

    #[test]
    fn test_flush_sends_request() {
        let (link, mut rx) = test_link();
        let pool = Pool::new("pool-a", "addr-a".into(), link.clone());
        pool.apply_flush_control_info(PoolCellInfo::default(), vec![class("osm", "raw", 4)]);

        let info = pool.flush_info("raw@osm").unwrap();
        info.flush(0).unwrap();
        assert!(info.is_flushing());

        let request = rx.try_recv().unwrap();
        assert_eq!(request.address.as_str(), "addr-a");
        assert_eq!(
            request.command,
            PoolCommand::Flush {
                storage_class: "raw@osm".into(),
                count: 0
            }
        );
        assert_eq!(link.metrics.flush_requests.get(), 1);
    }

    #[test]
    fn test_flush_unknown_class_is_driver_error() {
        let (link, _rx) = test_link();
        let pool = Pool::new("pool-a", "pool-a".into(), link);
        pool.apply_flush_control_info(PoolCellInfo::default(), vec![class("osm", "raw", 1)]);
        let info = pool.flush_info("raw@osm").unwrap();

        // the class disappears from the next answer
        pool.apply_flush_control_info(PoolCellInfo::default(), vec![]);
        assert_matches!(info.flush(1), Err(Error::Driver(_)));
        assert!(pool.flush_info("raw@osm").is_none());
    }

    #[test]
    fn test_control_disabled_rejects_mutations() {
        let (link, mut rx) = test_link();
        let pool = Pool::new("pool-a", "pool-a".into(), link.clone());
        pool.apply_flush_control_info(PoolCellInfo::default(), vec![class("osm", "raw", 1)]);
        link.set_controlled(false);

        assert_matches!(pool.set_read_only(true), Err(Error::ControlDisabled { .. }));
        let info = pool.flush_info("raw@osm").unwrap();
        assert_matches!(info.flush(1), Err(Error::ControlDisabled { .. }));

        // monitoring still works
        pool.query_mode().unwrap();
        assert_eq!(rx.try_recv().unwrap().command, PoolCommand::QueryMode);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_refresh_keeps_bookkeeping() {
        let (link, _rx) = test_link();
        let pool = Pool::new("pool-a", "pool-a".into(), link);
        pool.apply_flush_control_info(
            PoolCellInfo::default(),
            vec![class("osm", "raw", 3), class("osm", "tape", 1)],
        );
        pool.flush_info("raw@osm").unwrap().flush(0).unwrap();
        let (acked, _) = pool.with_flush_state("raw@osm", |s| s.set_acknowledged(42));
        assert!(acked);

        pool.apply_flush_control_info(PoolCellInfo::default(), vec![class("osm", "raw", 2)]);

        let details = pool.flush_infos();
        assert_eq!(details.len(), 1);
        assert!(details[0].is_flushing);
        assert_eq!(details[0].stats.request_count, 2);
        assert_eq!(pool.phase(), PoolPhase::QueryingIoMode);
        assert!(pool.is_active());
        assert_eq!(pool.answer_count(), 2);

        pool.apply_mode(PoolMode::from_read_only(false));
        assert_eq!(pool.phase(), PoolPhase::Flushing);
    }

    #[test]
    fn test_ack_after_finish_is_ignored() {
        let mut state = FlushState::new(StorageClassFlushInfo::new("osm", "raw"));
        state.set_requested();
        state.set_done();

        assert!(!state.set_acknowledged(7));
        assert!(!state.is_flushing());
        assert!(!state.flushing_pending);
        assert_eq!(state.flush_id, 0);

        // never requested at all
        let mut idle = FlushState::new(StorageClassFlushInfo::new("osm", "raw"));
        assert!(!idle.set_acknowledged(3));
        assert!(!idle.is_flushing());
    }

    #[test]
    fn test_request_carries_origin() {
        let (link, mut rx) = test_link();
        let pool = Pool::new("pool-a", "addr-a".into(), link.clone());
        pool.query_mode().unwrap();

        let request = rx.try_recv().unwrap();
        assert_eq!(request.pool, "pool-a");
        assert!(request.origin.ptr_eq(&pool));

        let replacement = Pool::new("pool-a", "addr-a".into(), link);
        assert!(!request.origin.ptr_eq(&replacement));
    }

    #[test]
    fn test_temporary_flush_state() {
        let (link, _rx) = test_link();
        let pool = Pool::new("pool-a", "pool-a".into(), link);

        let (name, real) = pool.with_flush_state("gone@osm", |s| {
            s.set_failed(5, Some("no space".into()));
            s.stats.full_name()
        });
        assert!(!real);
        assert_eq!(name, "gone@osm");
        assert!(pool.flush_infos().is_empty());
    }

    #[test]
    fn test_driver_handle() {
        let (link, _rx) = test_link();
        let pool = Pool::new("pool-a", "pool-a".into(), link);
        let state = Arc::new(Mutex::new(7u32));

        pool.set_driver_handle(&state);
        assert!(pool.same_driver_handle(&state));
        assert_eq!(*pool.driver_handle_as::<Mutex<u32>>().unwrap().lock(), 7);
        assert!(pool.driver_handle_as::<String>().is_none());

        let other = Arc::new(Mutex::new(7u32));
        assert!(!pool.same_driver_handle(&other));

        // the core never keeps driver state alive
        drop(state);
        assert!(pool.driver_handle().is_none());
    }

    #[test]
    fn test_mark_unreachable() {
        let (link, _rx) = test_link();
        let pool = Pool::new("pool-a", "pool-a".into(), link);
        pool.apply_flush_control_info(PoolCellInfo::default(), vec![]);
        assert!(pool.is_active());

        pool.mark_unreachable();
        assert!(!pool.is_active());
        assert_eq!(pool.answer_count(), 2);
        assert!(pool.last_updated().is_some());
    }

    #[test]
    fn test_split_class_name() {
        assert_eq!(split_class_name("raw:data@osm"), ("raw:data", "osm"));
        assert_eq!(split_class_name("plain"), ("plain", ""));
    }
}
