//! Driver Events
//!
//! Typed messages the flush control core hands to the loaded driver.

use crate::domain::ports::PoolMode;
use crate::driver::args::DriverArgs;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// I/O mode answer for a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoModeResult {
    pub pool: String,
    pub mode: PoolMode,
}

impl IoModeResult {
    pub fn is_read_only(&self) -> bool {
        self.mode.is_read_only()
    }
}

/// How a flush request ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushOutcomeKind {
    /// The pool accepted the request and is working on it
    Acknowledged { flush_id: u64 },
    /// All requested files were flushed
    Done,
    /// The pool rejected the request, or it never arrived
    Failed { error_code: i32, message: String },
}

/// Result of a flush request for one storage class on one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub pool: String,
    /// `<storageClass>@<hsm>`
    pub storage_class: String,
    pub kind: FlushOutcomeKind,
}

impl FlushOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self.kind, FlushOutcomeKind::Done)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.kind, FlushOutcomeKind::Failed { .. })
    }
}

/// Events delivered to the driver worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriverEvent {
    /// The pool group membership was (re)collected
    PoolSetupUpdated,
    ConfiguredPoolAdded { pool: String },
    ConfiguredPoolRemoved { pool: String },
    /// A gain-control answer (or its absence) changed the pool's flush infos
    PoolFlushInfoUpdated { pool: String },
    IoMode(IoModeResult),
    Flush(FlushOutcome),
    /// Operator supplied properties
    PropertiesUpdated(BTreeMap<String, String>),
    /// Free-form operator command
    Command(DriverArgs),
    Timer,
    Reset,
}

impl DriverEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DriverEvent::PoolSetupUpdated => "pool_setup_updated",
            DriverEvent::ConfiguredPoolAdded { .. } => "configured_pool_added",
            DriverEvent::ConfiguredPoolRemoved { .. } => "configured_pool_removed",
            DriverEvent::PoolFlushInfoUpdated { .. } => "pool_flush_info_updated",
            DriverEvent::IoMode(_) => "io_mode",
            DriverEvent::Flush(_) => "flush",
            DriverEvent::PropertiesUpdated(_) => "properties_updated",
            DriverEvent::Command(_) => "command",
            DriverEvent::Timer => "timer",
            DriverEvent::Reset => "reset",
        }
    }

    /// Name of the pool the event concerns, if any
    pub fn pool(&self) -> Option<&str> {
        match self {
            DriverEvent::ConfiguredPoolAdded { pool }
            | DriverEvent::ConfiguredPoolRemoved { pool }
            | DriverEvent::PoolFlushInfoUpdated { pool } => Some(pool),
            DriverEvent::IoMode(result) => Some(&result.pool),
            DriverEvent::Flush(outcome) => Some(&outcome.pool),
            _ => None,
        }
    }
}

/// Input of the driver worker task
#[derive(Debug)]
pub(crate) enum DriverMessage {
    Event(DriverEvent),
    /// Operator command whose textual answer is awaited
    Command {
        args: DriverArgs,
        respond_to: oneshot::Sender<Result<String>>,
    },
    /// Driver details for one storage class
    StorageInfo {
        storage_class: String,
        respond_to: oneshot::Sender<Result<BTreeMap<String, String>>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_pool() {
        let event = DriverEvent::Flush(FlushOutcome {
            pool: "pool-a".into(),
            storage_class: "raw@osm".into(),
            kind: FlushOutcomeKind::Done,
        });
        assert_eq!(event.pool(), Some("pool-a"));
        assert_eq!(event.kind(), "flush");
        assert_eq!(DriverEvent::Timer.pool(), None);
    }

    #[test]
    fn test_io_mode_result() {
        let result = IoModeResult {
            pool: "p".into(),
            mode: PoolMode::from_read_only(true),
        };
        assert!(result.is_read_only());
    }
}
