//! Attraction Registry
//!
//! In-memory registry of pools and the storage classes they attract.
//! Answers "which pools may serve this storage class for read or write".
//!
//! All mutations and multi-step reads go through one coarse lock. Registry
//! mutation is admin driven and rare compared to reads, and a read walks
//! pools × attractions, so the simplicity is worth more than read
//! concurrency. Every list handed out is a copy.

use super::events::RegistryEvent;
use super::selector::{Direction, PoolAttraction};
use crate::domain::ports::{FileAttributes, FileMetadataProvider, TransportAddress};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

// =============================================================================
// Pool Entry
// =============================================================================

/// Entry for a single pool in the registry
#[derive(Debug, Clone)]
pub struct PoolEntry {
    /// Pool name
    pub name: String,
    /// Where the transport reaches this pool
    pub address: TransportAddress,
    /// Attractions in registration order
    pub attractions: Vec<PoolAttraction>,
    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
}

impl PoolEntry {
    /// Create a new entry, stamping every attraction with the pool name
    pub fn new(name: String, address: TransportAddress, attractions: Vec<PoolAttraction>) -> Self {
        let attractions = attractions
            .into_iter()
            .map(|mut a| {
                a.pool = name.clone();
                a
            })
            .collect();

        Self {
            name,
            address,
            attractions,
            registered_at: Utc::now(),
        }
    }
}

// =============================================================================
// Registry Statistics
// =============================================================================

/// Counters across the registry lifetime
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub registrations: AtomicU64,
    pub replacements: AtomicU64,
    pub removals: AtomicU64,
    pub queries: AtomicU64,
}

impl RegistryStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self, pools: usize) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            pools: pools as u64,
            registrations: self.registrations.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub pools: u64,
    pub registrations: u64,
    pub replacements: u64,
    pub removals: u64,
    pub queries: u64,
}

// =============================================================================
// Attraction Registry
// =============================================================================

/// Registry of pool → storage class attractions
pub struct AttractionRegistry {
    pools: RwLock<HashMap<String, PoolEntry>>,
    stats: RegistryStats,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for AttractionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttractionRegistry")
            .field("pools", &self.pools.read().len())
            .finish()
    }
}

impl AttractionRegistry {
    /// Create a new, empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Insert or wholesale replace a pool entry. Attractions are not
    /// validated; a malformed selector simply never matches.
    pub fn add_pool_info(
        &self,
        pool: impl Into<String>,
        address: impl Into<TransportAddress>,
        attractions: Vec<PoolAttraction>,
    ) {
        let pool = pool.into();
        let entry = PoolEntry::new(pool.clone(), address.into(), attractions);
        let attraction_count = entry.attractions.len();

        let replaced = self.pools.write().insert(pool.clone(), entry).is_some();

        let event = if replaced {
            self.stats.replacements.fetch_add(1, Ordering::Relaxed);
            RegistryEvent::PoolReplaced {
                pool,
                attractions: attraction_count,
            }
        } else {
            self.stats.registrations.fetch_add(1, Ordering::Relaxed);
            RegistryEvent::PoolAdded {
                pool,
                attractions: attraction_count,
            }
        };
        debug!("Attraction registry: {:?}", event);
        let _ = self.event_sender.send(event);
    }

    /// Remove a pool. Returns false if it was not registered.
    pub fn remove_pool(&self, pool: &str) -> bool {
        let removed = self.pools.write().remove(pool).is_some();
        if removed {
            self.stats.removals.fetch_add(1, Ordering::Relaxed);
            let _ = self.event_sender.send(RegistryEvent::PoolRemoved {
                pool: pool.to_string(),
            });
        }
        removed
    }

    /// Check if a pool is registered
    pub fn pool_exists(&self, pool: &str) -> bool {
        self.pools.read().contains_key(pool)
    }

    /// Copy of a pool's entry
    pub fn pool_entry(&self, pool: &str) -> Option<PoolEntry> {
        self.pools.read().get(pool).cloned()
    }

    /// Transport address of a pool
    pub fn pool_path(&self, pool: &str) -> Result<TransportAddress> {
        self.pools
            .read()
            .get(pool)
            .map(|entry| entry.address.clone())
            .ok_or_else(|| Error::PoolNotFound {
                pool: pool.to_string(),
            })
    }

    /// Names of all registered pools
    pub fn active_pool_names(&self) -> BTreeSet<String> {
        self.pools.read().keys().cloned().collect()
    }

    /// Number of registered pools
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Registry statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.stats.snapshot(self.len())
    }

    /// Exact-name attractions for a storage class, unsorted.
    ///
    /// Template attractions are not considered. The result may hold several
    /// attractions of the same pool; de-duplicating by pool is up to the
    /// caller.
    pub fn candidates_by_class(&self, hsm: &str, storage_class: &str, for_write: bool) -> Vec<PoolAttraction> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        let hsm = hsm.to_lowercase();
        let direction = Direction::for_write(for_write);

        let pools = self.pools.read();
        pools
            .values()
            .flat_map(|entry| entry.attractions.iter())
            .filter(|a| {
                a.hsm_matches(&hsm) && a.selector.is_exact_name(storage_class) && a.serves(direction)
            })
            .cloned()
            .collect()
    }

    /// Exact-name attractions for a storage class, most attractive pool
    /// first, one attraction per pool.
    ///
    /// Ordered by preference descending, then pool name ascending, so pools
    /// with equal preference are all kept and always come out in the same
    /// order.
    pub fn sorted_candidates_by_class(
        &self,
        hsm: &str,
        storage_class: &str,
        for_write: bool,
    ) -> Vec<PoolAttraction> {
        let direction = Direction::for_write(for_write);
        let candidates = self.candidates_by_class(hsm, storage_class, for_write);

        let ordered: BTreeSet<(Reverse<i32>, &str, usize)> = candidates
            .iter()
            .enumerate()
            .map(|(idx, a)| (Reverse(a.preference(direction)), a.pool.as_str(), idx))
            .collect();

        let mut seen = HashSet::new();
        ordered
            .into_iter()
            .filter(|(_, pool, _)| seen.insert(*pool))
            .map(|(_, _, idx)| candidates[idx].clone())
            .collect()
    }

    /// Attractions that apply to a file, exact and template alike
    pub fn candidates_for_file(&self, file: &FileAttributes, for_write: bool) -> Vec<PoolAttraction> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        let direction = Direction::for_write(for_write);

        let pools = self.pools.read();
        pools
            .values()
            .flat_map(|entry| entry.attractions.iter())
            .filter(|a| a.serves(direction) && a.matches_file(file))
            .cloned()
            .collect()
    }

    /// Resolve a file through the metadata provider, then select candidates
    pub async fn candidates_for_file_id(
        &self,
        provider: &dyn FileMetadataProvider,
        file_id: &str,
        for_write: bool,
    ) -> Result<Vec<PoolAttraction>> {
        let file = provider.file_attributes(file_id).await?;
        Ok(self.candidates_for_file(&file, for_write))
    }
}

impl Default for AttractionRegistry {
    fn default() -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            pools: RwLock::new(HashMap::new()),
            stats: RegistryStats::default(),
            event_sender,
        }
    }
}
