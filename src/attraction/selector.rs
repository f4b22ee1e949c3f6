//! Storage Class Attractions
//!
//! An attraction ties a pool to a storage class (by exact name or by an
//! attribute template) with separate read and write preferences.

use crate::domain::ports::FileAttributes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Direction
// =============================================================================

/// Transfer direction a candidate is selected for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn for_write(for_write: bool) -> Self {
        if for_write {
            Direction::Write
        } else {
            Direction::Read
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

// =============================================================================
// Selector
// =============================================================================

/// How an attraction picks the storage classes it applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClassSelector {
    /// Case-sensitive storage class name
    Exact(String),
    /// Every key must be present with an equal value in the file's attributes
    Template(BTreeMap<String, String>),
}

impl StorageClassSelector {
    pub fn exact(name: impl Into<String>) -> Self {
        StorageClassSelector::Exact(name.into())
    }

    pub fn template<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        StorageClassSelector::Template(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// True for `Exact(name)`
    #[inline]
    pub fn is_exact_name(&self, name: &str) -> bool {
        matches!(self, StorageClassSelector::Exact(n) if n == name)
    }

    /// Match against a file's storage class name and attribute map
    pub fn matches(&self, storage_class: &str, attributes: &BTreeMap<String, String>) -> bool {
        match self {
            StorageClassSelector::Exact(name) => name == storage_class,
            StorageClassSelector::Template(template) => template
                .iter()
                .all(|(key, value)| attributes.get(key) == Some(value)),
        }
    }
}

impl std::fmt::Display for StorageClassSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageClassSelector::Exact(name) => write!(f, "{}", name),
            StorageClassSelector::Template(template) => {
                let parts: Vec<String> = template
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

// =============================================================================
// Pool Attraction
// =============================================================================

/// A (pool, storage class) affinity with per-direction preferences.
///
/// A preference of zero or less means the pool does not serve that direction
/// for the class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAttraction {
    /// Pool this attraction belongs to
    #[serde(default)]
    pub pool: String,
    /// HSM organization, compared case-insensitively
    pub hsm: String,
    pub selector: StorageClassSelector,
    #[serde(default)]
    pub read_preference: i32,
    #[serde(default)]
    pub write_preference: i32,
}

impl PoolAttraction {
    pub fn new(
        hsm: impl Into<String>,
        selector: StorageClassSelector,
        read_preference: i32,
        write_preference: i32,
    ) -> Self {
        Self {
            pool: String::new(),
            hsm: hsm.into(),
            selector,
            read_preference,
            write_preference,
        }
    }

    /// Attraction to an exact storage class name
    pub fn exact(hsm: impl Into<String>, storage_class: impl Into<String>, read: i32, write: i32) -> Self {
        Self::new(hsm, StorageClassSelector::exact(storage_class), read, write)
    }

    /// Preference for the given direction
    #[inline]
    pub fn preference(&self, direction: Direction) -> i32 {
        match direction {
            Direction::Read => self.read_preference,
            Direction::Write => self.write_preference,
        }
    }

    /// Whether this pool serves the direction at all
    #[inline]
    pub fn serves(&self, direction: Direction) -> bool {
        self.preference(direction) > 0
    }

    /// `hsm` must already be lower-cased
    #[inline]
    pub(crate) fn hsm_matches(&self, hsm: &str) -> bool {
        self.hsm.to_lowercase() == hsm
    }

    /// Whether this attraction applies to a file
    pub fn matches_file(&self, file: &FileAttributes) -> bool {
        self.hsm_matches(&file.hsm.to_lowercase())
            && self.selector.matches(&file.storage_class, &file.attributes)
    }
}

impl std::fmt::Display for PoolAttraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}@{} (r={},w={})",
            self.pool, self.selector, self.hsm, self.read_preference, self.write_preference
        )
    }
}
