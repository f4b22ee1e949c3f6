//! Flush Control Module
//!
//! The façade a driver sees: configured pools, their flush infos, and the
//! typed events that report replies back to it.

pub mod control;
mod dispatch;
pub mod events;
pub mod pool;

pub use control::{FlushControl, FlushControlCore, PoolSetChange, TRANSPORT_FAILURE_CODE};
pub(crate) use dispatch::spawn_dispatcher;
pub use events::{DriverEvent, FlushOutcome, FlushOutcomeKind, IoModeResult};
pub use pool::{FlushInfo, FlushInfoDetails, Pool, PoolDetails, PoolPhase};
