//! Loopback Transport
//!
//! In-process simulation of pools and pool groups. Pools answer mode,
//! gain-control and flush commands from their simulated state; flushes
//! finish after a delay and are reported through the attached reply sink.

use crate::domain::ports::{
    PoolCellInfo, PoolCommand, PoolMode, PoolReply, ReplySink, StorageClassFlushInfo, Transport,
    TransportAddress,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error code a simulated pool reports for a storage class it does not hold
pub const UNKNOWN_CLASS_CODE: i32 = 2;

/// Default time a simulated flush takes
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(50);

/// State of one simulated pool
#[derive(Debug, Clone)]
pub struct SimulatedPool {
    pub name: String,
    pub mode: PoolMode,
    pub reachable: bool,
    pub cell_info: PoolCellInfo,
    /// Keyed by `<storageClass>@<hsm>`
    pub flush_infos: IndexMap<String, StorageClassFlushInfo>,
    /// Last gain-control hold time received
    pub hold_millis: u64,
    /// Reject every flush with this code and message
    pub flush_failure: Option<(i32, String)>,
    next_flush_id: u64,
}

impl SimulatedPool {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: PoolMode::from_read_only(false),
            reachable: true,
            cell_info: PoolCellInfo::default(),
            flush_infos: IndexMap::new(),
            hold_millis: 0,
            flush_failure: None,
            next_flush_id: 1,
        }
    }

    fn flush_control_info(&self) -> (PoolCellInfo, Vec<StorageClassFlushInfo>) {
        (
            self.cell_info.clone(),
            self.flush_infos.values().cloned().collect(),
        )
    }

    /// Flush `count` files (0 = all) of `storage_class`, moving their bytes
    /// from precious to removable
    fn complete_flush(&mut self, storage_class: &str, count: u32) {
        let info = match self.flush_infos.get_mut(storage_class) {
            Some(info) => info,
            None => return,
        };
        let pending = info.request_count;
        let flushed = if count == 0 || count >= pending {
            pending
        } else {
            count
        };
        let bytes = if pending == 0 {
            0
        } else if flushed == pending {
            info.total_pending_file_size
        } else {
            info.total_pending_file_size / pending as u64 * flushed as u64
        };

        info.request_count -= flushed;
        info.total_pending_file_size -= bytes;
        if info.request_count == 0 {
            info.oldest_file_timestamp = 0;
        }
        self.cell_info.precious_space = self.cell_info.precious_space.saturating_sub(bytes);
        self.cell_info.removable_space += bytes;
    }
}

#[derive(Debug, Default)]
struct LoopbackInner {
    /// Keyed by transport address
    pools: RwLock<BTreeMap<String, SimulatedPool>>,
    groups: RwLock<BTreeMap<String, BTreeSet<String>>>,
    reply_sink: Mutex<Option<ReplySink>>,
    sent: Mutex<Vec<(TransportAddress, PoolCommand)>>,
}

/// Simulated transport
#[derive(Debug)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
    flush_delay: Duration,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Self::with_flush_delay(DEFAULT_FLUSH_DELAY)
    }

    pub fn with_flush_delay(flush_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(LoopbackInner::default()),
            flush_delay,
        })
    }

    /// Where finished flushes are reported
    pub fn attach_reply_sink(&self, sink: ReplySink) {
        *self.inner.reply_sink.lock() = Some(sink);
    }

    /// Add a pool reachable under its own name
    pub fn add_pool(&self, name: &str, groups: &[&str]) {
        self.add_pool_at(name, name, groups);
    }

    pub fn add_pool_at(&self, name: &str, address: &str, groups: &[&str]) {
        self.inner
            .pools
            .write()
            .insert(address.to_string(), SimulatedPool::new(name));
        let mut known = self.inner.groups.write();
        for group in groups {
            known
                .entry(group.to_string())
                .or_default()
                .insert(name.to_string());
        }
    }

    /// Make an (initially empty) pool group known
    pub fn add_group(&self, group: &str) {
        self.inner.groups.write().entry(group.to_string()).or_default();
    }

    /// Change the simulated state of the pool at `address`
    pub fn update_pool<R>(&self, address: &str, f: impl FnOnce(&mut SimulatedPool) -> R) -> Option<R> {
        self.inner.pools.write().get_mut(address).map(f)
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        self.update_pool(address, |pool| pool.reachable = reachable);
    }

    pub fn set_cell_info(&self, address: &str, cell_info: PoolCellInfo) {
        self.update_pool(address, |pool| pool.cell_info = cell_info);
    }

    pub fn set_storage_class(&self, address: &str, info: StorageClassFlushInfo) {
        self.update_pool(address, |pool| {
            pool.flush_infos.insert(info.full_name(), info);
        });
    }

    pub fn fail_flushes(&self, address: &str, failure: Option<(i32, String)>) {
        self.update_pool(address, |pool| pool.flush_failure = failure);
    }

    pub fn pool(&self, address: &str) -> Option<SimulatedPool> {
        self.inner.pools.read().get(address).cloned()
    }

    /// Every command sent so far, in order
    pub fn sent_commands(&self) -> Vec<(TransportAddress, PoolCommand)> {
        self.inner.sent.lock().clone()
    }

    fn schedule_flush_completion(&self, address: String, storage_class: String, count: u32) {
        let inner = self.inner.clone();
        let delay = self.flush_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let reply = {
                let mut pools = inner.pools.write();
                let pool = match pools.get_mut(&address) {
                    Some(pool) => pool,
                    None => return,
                };
                pool.complete_flush(&storage_class, count);
                let (cell_info, flush_infos) = pool.flush_control_info();
                PoolReply::FlushFinished {
                    pool: pool.name.clone(),
                    storage_class,
                    cell_info,
                    flush_infos,
                }
            };

            let sink = inner.reply_sink.lock().clone();
            match sink {
                Some(sink) => {
                    if sink.send(reply).is_err() {
                        debug!("Reply sink closed, flush completion dropped");
                    }
                }
                None => debug!("No reply sink attached, flush completion dropped"),
            }
        });
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, address: &TransportAddress, command: PoolCommand) -> Result<PoolReply> {
        self.inner
            .sent
            .lock()
            .push((address.clone(), command.clone()));

        let mut pools = self.inner.pools.write();
        let pool = match pools.get_mut(address.as_str()) {
            Some(pool) if pool.reachable => pool,
            _ => return Err(Error::transport(address.as_str(), "no route to pool")),
        };

        let reply = match command {
            PoolCommand::QueryMode => PoolReply::PoolMode {
                pool: pool.name.clone(),
                mode: pool.mode,
            },
            PoolCommand::SetMode { read_only } => {
                pool.mode = PoolMode::from_read_only(read_only);
                PoolReply::PoolMode {
                    pool: pool.name.clone(),
                    mode: pool.mode,
                }
            }
            PoolCommand::GainControl { hold_millis } => {
                pool.hold_millis = hold_millis;
                let (cell_info, flush_infos) = pool.flush_control_info();
                PoolReply::FlushControlInfo {
                    pool: pool.name.clone(),
                    cell_info,
                    flush_infos,
                }
            }
            PoolCommand::Flush {
                storage_class,
                count,
            } => {
                if let Some((error_code, message)) = pool.flush_failure.clone() {
                    PoolReply::FlushFailed {
                        pool: pool.name.clone(),
                        storage_class,
                        error_code,
                        message,
                    }
                } else if !pool.flush_infos.contains_key(&storage_class) {
                    PoolReply::FlushFailed {
                        pool: pool.name.clone(),
                        storage_class: storage_class.clone(),
                        error_code: UNKNOWN_CLASS_CODE,
                        message: format!("storage class {} not found", storage_class),
                    }
                } else {
                    let flush_id = pool.next_flush_id;
                    pool.next_flush_id += 1;
                    let name = pool.name.clone();
                    drop(pools);
                    self.schedule_flush_completion(
                        address.as_str().to_string(),
                        storage_class.clone(),
                        count,
                    );
                    return Ok(PoolReply::FlushAck {
                        pool: name,
                        storage_class,
                        flush_id,
                    });
                }
            }
        };
        Ok(reply)
    }

    async fn pool_group_members(&self, group: &str) -> Result<Vec<String>> {
        self.inner
            .groups
            .read()
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .ok_or_else(|| Error::transport(format!("pool group {}", group), "no such pool group"))
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    fn raw(pending: u32, bytes: u64) -> StorageClassFlushInfo {
        StorageClassFlushInfo {
            request_count: pending,
            total_pending_file_size: bytes,
            ..StorageClassFlushInfo::new("osm", "raw")
        }
    }

    #[tokio::test]
    async fn test_mode_commands() {
        let transport = LoopbackTransport::new();
        transport.add_pool("pool-a", &["writers"]);
        let address = TransportAddress::new("pool-a");

        let reply = transport
            .send(&address, PoolCommand::SetMode { read_only: true })
            .await
            .unwrap();
        assert_matches!(reply, PoolReply::PoolMode { mode, .. } if mode.is_read_only());

        let reply = transport.send(&address, PoolCommand::QueryMode).await.unwrap();
        assert_eq!(
            reply,
            PoolReply::PoolMode {
                pool: "pool-a".into(),
                mode: PoolMode::from_read_only(true)
            }
        );
        assert_eq!(transport.sent_commands().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_pool() {
        let transport = LoopbackTransport::new();
        transport.add_pool("pool-a", &[]);
        transport.set_reachable("pool-a", false);

        let err = transport
            .send(&"pool-a".into(), PoolCommand::GainControl { hold_millis: 0 })
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let err = transport
            .send(&"nowhere".into(), PoolCommand::QueryMode)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Transport { .. });
    }

    #[tokio::test]
    async fn test_flush_completes_through_sink() {
        let transport = LoopbackTransport::with_flush_delay(Duration::from_millis(1));
        let (sink, mut replies) = mpsc::unbounded_channel();
        transport.attach_reply_sink(sink);
        transport.add_pool("pool-a", &[]);
        transport.set_cell_info(
            "pool-a",
            PoolCellInfo {
                total_space: 1000,
                precious_space: 400,
                ..Default::default()
            },
        );
        transport.set_storage_class("pool-a", raw(4, 400));

        let reply = transport
            .send(
                &"pool-a".into(),
                PoolCommand::Flush {
                    storage_class: "raw@osm".into(),
                    count: 1,
                },
            )
            .await
            .unwrap();
        assert_matches!(reply, PoolReply::FlushAck { flush_id: 1, .. });

        let finished = replies.recv().await.unwrap();
        match finished {
            PoolReply::FlushFinished {
                cell_info,
                flush_infos,
                ..
            } => {
                assert_eq!(flush_infos[0].request_count, 3);
                assert_eq!(flush_infos[0].total_pending_file_size, 300);
                assert_eq!(cell_info.precious_space, 300);
                assert_eq!(cell_info.removable_space, 100);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flush_failures() {
        let transport = LoopbackTransport::new();
        transport.add_pool("pool-a", &[]);

        let reply = transport
            .send(
                &"pool-a".into(),
                PoolCommand::Flush {
                    storage_class: "tape@osm".into(),
                    count: 0,
                },
            )
            .await
            .unwrap();
        assert_matches!(reply, PoolReply::FlushFailed { error_code: UNKNOWN_CLASS_CODE, .. });

        transport.set_storage_class("pool-a", raw(1, 10));
        transport.fail_flushes("pool-a", Some((28, "tape drive offline".into())));
        let reply = transport
            .send(
                &"pool-a".into(),
                PoolCommand::Flush {
                    storage_class: "raw@osm".into(),
                    count: 0,
                },
            )
            .await
            .unwrap();
        assert_matches!(reply, PoolReply::FlushFailed { error_code: 28, .. });
    }

    #[tokio::test]
    async fn test_group_members() {
        let transport = LoopbackTransport::new();
        transport.add_pool("pool-b", &["writers"]);
        transport.add_pool_at("pool-a", "pool-a@domain", &["writers", "readers"]);
        transport.add_group("empty");

        assert_eq!(
            transport.pool_group_members("writers").await.unwrap(),
            vec!["pool-a", "pool-b"]
        );
        assert!(transport.pool_group_members("empty").await.unwrap().is_empty());
        assert!(transport.pool_group_members("unknown").await.is_err());
        assert!(transport.pool("pool-a@domain").is_some());
    }
}
