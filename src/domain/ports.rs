//! Domain Ports - Core trait definitions for flush control
//!
//! These traits define the boundaries between the flush control core and
//! external systems. The message transport and the file metadata provider
//! live outside this crate; adapters implement these traits.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

// =============================================================================
// Transport Address
// =============================================================================

/// Opaque address used by the transport to reach a pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportAddress(pub String);

impl TransportAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TransportAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransportAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Pool Mode
// =============================================================================

/// Pool I/O mode as a READ/WRITE bit set. Zero means not known yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolMode(pub u8);

impl PoolMode {
    pub const UNDEFINED: PoolMode = PoolMode(0);
    pub const READ: u8 = 0x1;
    pub const WRITE: u8 = 0x2;

    /// Mode for a pool that is readable, writable only if `read_only` is false
    pub fn from_read_only(read_only: bool) -> Self {
        if read_only {
            PoolMode(Self::READ)
        } else {
            PoolMode(Self::READ | Self::WRITE)
        }
    }

    #[inline]
    pub fn is_known(&self) -> bool {
        self.0 != 0
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.0 & Self::WRITE == 0
    }

    #[inline]
    pub fn can_read(&self) -> bool {
        self.0 & Self::READ != 0
    }
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_known() {
            return write!(f, "UU");
        }
        let r = if self.can_read() { "R" } else { "-" };
        let w = if self.is_read_only() { "-" } else { "W" };
        write!(f, "{}{}", r, w)
    }
}

// =============================================================================
// Pool-Reported Information
// =============================================================================

/// Store queue occupancy reported by a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub active: u32,
    pub queued: u32,
}

/// Space and queue information a pool reports about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCellInfo {
    /// Total space in bytes
    pub total_space: u64,
    /// Free space in bytes
    pub free_space: u64,
    /// Space held by precious (not yet flushed) files
    pub precious_space: u64,
    /// Space held by removable (already flushed) files
    pub removable_space: u64,
    /// Store (flush) queue
    pub store_queue: QueueInfo,
    /// Free-form pool tags, `hostname` among them
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl PoolCellInfo {
    /// Fraction of the pool occupied by precious files
    pub fn precious_fraction(&self) -> f64 {
        if self.total_space == 0 {
            return 0.0;
        }
        self.precious_space as f64 / self.total_space as f64
    }

    /// Value of the `hostname` tag
    pub fn host_tag(&self) -> Option<&str> {
        self.tags.get("hostname").map(String::as_str)
    }
}

/// Per storage class flush backlog reported by a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClassFlushInfo {
    pub hsm: String,
    pub storage_class: String,
    /// Precious files waiting to be flushed
    pub request_count: u32,
    /// Files whose last flush attempt failed
    pub failed_request_count: u32,
    /// Bytes waiting to be flushed
    pub total_pending_file_size: u64,
    /// Files currently being flushed
    pub active_count: u32,
    /// Unix millis of the oldest pending file, 0 if none
    pub oldest_file_timestamp: i64,
}

impl StorageClassFlushInfo {
    pub fn new(hsm: impl Into<String>, storage_class: impl Into<String>) -> Self {
        Self {
            hsm: hsm.into(),
            storage_class: storage_class.into(),
            ..Default::default()
        }
    }

    /// `<storageClass>@<hsm>`, the key used for flush infos on a pool
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.storage_class, self.hsm)
    }
}

// =============================================================================
// Commands and Replies
// =============================================================================

/// Commands the core sends to pools through the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolCommand {
    /// Ask for the current I/O mode
    QueryMode,
    /// Change the I/O mode
    SetMode { read_only: bool },
    /// Take over flush control for `hold_millis`; zero hands control back
    GainControl { hold_millis: u64 },
    /// Flush up to `count` precious files of a storage class (0 = all)
    Flush { storage_class: String, count: u32 },
}

impl PoolCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            PoolCommand::QueryMode => "query_mode",
            PoolCommand::SetMode { .. } => "set_mode",
            PoolCommand::GainControl { .. } => "gain_control",
            PoolCommand::Flush { .. } => "flush",
        }
    }
}

/// Replies arriving from pools, solicited or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PoolReply {
    /// Current I/O mode of a pool
    PoolMode { pool: String, mode: PoolMode },
    /// Answer to a gain-control request
    FlushControlInfo {
        pool: String,
        cell_info: PoolCellInfo,
        flush_infos: Vec<StorageClassFlushInfo>,
    },
    /// Gain-control request could not be delivered
    Unreachable { pool: String },
    /// The pool accepted a flush request
    FlushAck {
        pool: String,
        storage_class: String,
        flush_id: u64,
    },
    /// A flush request finished
    FlushFinished {
        pool: String,
        storage_class: String,
        cell_info: PoolCellInfo,
        flush_infos: Vec<StorageClassFlushInfo>,
    },
    /// A flush request was rejected or failed
    FlushFailed {
        pool: String,
        storage_class: String,
        error_code: i32,
        message: String,
    },
    /// Nothing to report (fire-and-forget commands)
    Ok { pool: String },
}

impl PoolReply {
    /// Name of the pool this reply is about
    pub fn pool(&self) -> &str {
        match self {
            PoolReply::PoolMode { pool, .. }
            | PoolReply::FlushControlInfo { pool, .. }
            | PoolReply::Unreachable { pool }
            | PoolReply::FlushAck { pool, .. }
            | PoolReply::FlushFinished { pool, .. }
            | PoolReply::FlushFailed { pool, .. }
            | PoolReply::Ok { pool } => pool,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PoolReply::PoolMode { .. } => "pool_mode",
            PoolReply::FlushControlInfo { .. } => "flush_control_info",
            PoolReply::Unreachable { .. } => "unreachable",
            PoolReply::FlushAck { .. } => "flush_ack",
            PoolReply::FlushFinished { .. } => "flush_finished",
            PoolReply::FlushFailed { .. } => "flush_failed",
            PoolReply::Ok { .. } => "ok",
        }
    }
}

/// Channel on which transports deliver unsolicited replies
pub type ReplySink = mpsc::UnboundedSender<PoolReply>;

// =============================================================================
// Transport Port
// =============================================================================

/// Port for delivering commands to pools
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a command and wait for the immediate reply. Timeouts are the
    /// transport's business and surface as `Error::Transport`.
    async fn send(&self, address: &TransportAddress, command: PoolCommand) -> Result<PoolReply>;

    /// Names of the pools in a pool group
    async fn pool_group_members(&self, group: &str) -> Result<Vec<String>>;

    /// Transport name for logging
    fn name(&self) -> &str;
}

// =============================================================================
// File Metadata Port
// =============================================================================

/// Storage-class membership attributes of a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub hsm: String,
    pub storage_class: String,
    pub attributes: BTreeMap<String, String>,
}

impl FileAttributes {
    pub fn new(hsm: impl Into<String>, storage_class: impl Into<String>) -> Self {
        Self {
            hsm: hsm.into(),
            storage_class: storage_class.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Port for resolving a file identifier to its storage attributes
#[async_trait]
pub trait FileMetadataProvider: Send + Sync {
    async fn file_attributes(&self, file_id: &str) -> Result<FileAttributes>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type TransportRef = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_mode_display() {
        assert_eq!(PoolMode::UNDEFINED.to_string(), "UU");
        assert_eq!(PoolMode::from_read_only(true).to_string(), "R-");
        assert_eq!(PoolMode::from_read_only(false).to_string(), "RW");
    }

    #[test]
    fn test_pool_mode_flags() {
        assert!(!PoolMode::UNDEFINED.is_known());
        assert!(PoolMode::UNDEFINED.is_read_only());
        assert!(!PoolMode::from_read_only(false).is_read_only());
        assert!(PoolMode::from_read_only(true).is_known());
    }

    #[test]
    fn test_flush_info_full_name() {
        let info = StorageClassFlushInfo::new("osm", "raw:data");
        assert_eq!(info.full_name(), "raw:data@osm");
    }

    #[test]
    fn test_precious_fraction() {
        let info = PoolCellInfo {
            total_space: 1000,
            precious_space: 250,
            ..Default::default()
        };
        assert!((info.precious_fraction() - 0.25).abs() < f64::EPSILON);
        assert_eq!(PoolCellInfo::default().precious_fraction(), 0.0);
    }

    #[test]
    fn test_host_tag() {
        let mut info = PoolCellInfo::default();
        assert_eq!(info.host_tag(), None);
        info.tags.insert("hostname".into(), "dcache-07".into());
        assert_eq!(info.host_tag(), Some("dcache-07"));
    }
}
