//! Registry Events
//!
//! Events emitted by the attraction registry so that consumers can react to
//! pool registration changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the attraction registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A pool was registered for the first time
    PoolAdded { pool: String, attractions: usize },

    /// An existing pool entry was replaced wholesale
    PoolReplaced { pool: String, attractions: usize },

    /// A pool was removed
    PoolRemoved { pool: String },
}

impl RegistryEvent {
    /// Get the pool name associated with this event
    pub fn pool(&self) -> &str {
        match self {
            RegistryEvent::PoolAdded { pool, .. } => pool,
            RegistryEvent::PoolReplaced { pool, .. } => pool,
            RegistryEvent::PoolRemoved { pool } => pool,
        }
    }

    /// Check if the pool still exists after this event
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            RegistryEvent::PoolAdded { .. } | RegistryEvent::PoolReplaced { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_pool() {
        let event = RegistryEvent::PoolAdded {
            pool: "pool-a".to_string(),
            attractions: 2,
        };
        assert_eq!(event.pool(), "pool-a");
        assert!(event.is_registration());

        let event = RegistryEvent::PoolRemoved {
            pool: "pool-a".to_string(),
        };
        assert!(!event.is_registration());
    }
}
