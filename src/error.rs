//! Error types for HSM flush control
//!
//! Provides structured error types for the attraction registry, the driver
//! registry, the flush control core and the scheduler.

use thiserror::Error;

/// Unified error type for the flush control core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Pool not found: {pool}")]
    PoolNotFound { pool: String },

    #[error("Storage class not found: {storage_class} on pool {pool}")]
    StorageClassNotFound { pool: String, storage_class: String },

    #[error("File not found: {file_id}")]
    FileNotFound { file_id: String },

    #[error("No driver defined for hsm type: {hsm_type}")]
    DriverNotFound { hsm_type: String },

    // =========================================================================
    // Driver Errors
    // =========================================================================
    #[error("Driver load failed: {driver_class} - {reason}")]
    DriverLoad { driver_class: String, reason: String },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Driver already loaded: {driver}")]
    DriverAlreadyLoaded { driver: String },

    #[error("No driver loaded")]
    NoDriverLoaded,

    #[error("Flush control is disabled, refusing {operation} on pool {pool}")]
    ControlDisabled { pool: String, operation: String },

    // =========================================================================
    // Reply / Transport Errors
    // =========================================================================
    #[error("Stale reply for pool {pool}: {reply}")]
    StaleReply { pool: String, reply: String },

    #[error("Transport error: {address} - {reason}")]
    Transport { address: String, reason: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the scheduler does with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Leave the request outstanding; the next evaluation tick retries it
    RetryNextTick,
    /// Log and drop
    Discard,
    /// Surface to the caller, nothing will change on its own
    Fail,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Slow and failed requests are treated alike
            Error::Transport { .. } => ErrorAction::RetryNextTick,

            Error::StaleReply { .. } => ErrorAction::Discard,

            // Lookup, load, configuration and driver precondition errors
            _ => ErrorAction::Fail,
        }
    }

    /// Check if this error goes away on a later evaluation pass
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryNextTick)
    }

    /// Check if this error reports an unknown pool, class or driver
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::PoolNotFound { .. }
                | Error::StorageClassNotFound { .. }
                | Error::DriverNotFound { .. }
                | Error::FileNotFound { .. }
        )
    }

    pub(crate) fn transport(address: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Transport {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_error_actions() {
        let err = Error::transport("pool-a", "timed out");
        assert_eq!(err.action(), ErrorAction::RetryNextTick);
        assert!(err.is_retryable());

        let err = Error::StaleReply {
            pool: "gone".into(),
            reply: "PoolMode".into(),
        };
        assert_eq!(err.action(), ErrorAction::Discard);

        let err = Error::DriverLoad {
            driver_class: "nope".into(),
            reason: "unknown".into(),
        };
        assert_eq!(err.action(), ErrorAction::Fail);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_found_kinds() {
        assert!(Error::PoolNotFound { pool: "p".into() }.is_not_found());
        assert!(Error::DriverNotFound { hsm_type: "osm".into() }.is_not_found());
        assert!(!Error::Driver("x".into()).is_not_found());
    }

    #[test]
    fn test_yaml_error_converts() {
        let parsed: std::result::Result<Vec<u32>, _> = serde_yaml::from_str("{ not: [a list");
        let err: Error = parsed.unwrap_err().into();
        assert_matches!(err, Error::YamlParse(_));
    }
}
