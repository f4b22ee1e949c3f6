//! HSM Flush Control
//!
//! Decides when the precious (not yet written to tape) files on disk pools
//! are flushed to the tertiary storage system, and where reads and writes
//! of a storage class should go.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Flush Scheduler                              │
//! │   pool group collection · gain control · driver timer · status       │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐   events    ┌──────────────────────────────┐  │
//! │  │   Flush Control    │ ──────────▶ │   Driver Worker              │  │
//! │  │ (pool bookkeeping) │ ◀────────── │   (alternate flush, ...)     │  │
//! │  └─────────┬──────────┘  commands   └──────────────────────────────┘  │
//! │            │ requests / replies                                       │
//! ├────────────┴─────────────────────────────────────────────────────────┤
//! │  Transport (loopback simulation or external message layer)            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`attraction`]: Pool attractions and candidate selection
//! - [`config`]: YAML configuration
//! - [`domain`]: Core domain types and ports
//! - [`driver`]: Flush drivers and the driver registry
//! - [`error`]: Error types and handling
//! - [`flush`]: Per-pool flush bookkeeping
//! - [`scheduler`]: Periodic evaluation and administration
//! - [`transport`]: Transport adapters

pub mod attraction;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod flush;
pub mod metadata;
pub mod metrics;
pub mod scheduler;
pub mod transport;

// Re-export commonly used types
pub use attraction::{AttractionRegistry, PoolAttraction, StorageClassSelector};

pub use config::FlushControlConfig;

pub use domain::ports::{
    FileAttributes, FileMetadataProvider, PoolCellInfo, PoolCommand, PoolMode, PoolReply,
    StorageClassFlushInfo, Transport, TransportAddress,
};

pub use driver::{AlternateFlush, AlternatingFlush, DriverArgs, DriverRegistry, HsmControllable};

pub use error::{Error, ErrorAction, Result};

pub use flush::{DriverEvent, FlushControl, FlushControlCore, FlushInfo, Pool};

pub use metrics::FlushMetrics;

pub use scheduler::{FlushControlCellInfo, FlushScheduler, SchedulerConfig};

pub use transport::LoopbackTransport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
