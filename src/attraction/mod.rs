//! Attraction Module
//!
//! Pool → storage class attractions and the candidate selection built on
//! them.

pub mod events;
pub mod registry;
pub mod selector;

pub use events::*;
pub use registry::*;
pub use selector::*;
