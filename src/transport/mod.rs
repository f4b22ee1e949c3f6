//! Transport Adapters
//!
//! Implementations of the [`Transport`](crate::domain::ports::Transport)
//! port. The production message transport lives outside this crate; the
//! loopback simulation runs the core standalone and in tests.

pub mod loopback;

pub use loopback::{LoopbackTransport, SimulatedPool};
