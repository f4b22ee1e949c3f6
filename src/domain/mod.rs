//! Domain layer - Pool values, commands and replies
//!
//! The ports here ([`Transport`](ports::Transport),
//! [`FileMetadataProvider`](ports::FileMetadataProvider)) are what the core
//! needs from the outside world.

pub mod ports;

pub use ports::*;
