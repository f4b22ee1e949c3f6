//! Alternating Flush Driver
//!
//! Pools are grouped into pool sets by their `hostname` tag (pools without
//! one form a set of their own, `x-<pool>`). On every rule pass the pool
//! with the largest backlog is picked and its whole pool set is switched
//! read-only, flushed, and switched back to its previous modes once every
//! member finished. A pool set is only taken out of write service while the
//! read-only pools stay within `max.rdonly.fraction` of the available ones.
//!
//! The backlog of a pool is the mean of three ratios: precious space over
//! `max.megabytes`, pending files over `max.files`, and the age of the
//! oldest pending file over `max.minutes`. Exceeding any one of the limits
//! makes the pool a candidate.
//!
//! Parameters are reloaded from the `driver-config-file` load option
//! (`key=value` lines, `#` comments) whenever the file changes.

use super::args::DriverArgs;
use super::HsmControllable;
use crate::error::{Error, Result};
use crate::flush::{DriverEvent, FlushControlCore, FlushOutcomeKind, Pool};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Load option naming the parameter file
pub const CONFIG_FILE_OPTION: &str = "driver-config-file";

const MEGA_BYTES: u64 = 1024 * 1024;
const MINUTE_MILLIS: u64 = 60_000;
const MAX_VALUE: u64 = 999_999_999;

// =============================================================================
// Parameters
// =============================================================================

/// Tunables of the alternating driver
#[derive(Debug, Clone, PartialEq)]
pub struct AltParameters {
    /// `max.files`
    pub max_files: u64,
    /// `max.megabytes`
    pub max_megabytes: u64,
    /// `max.minutes`
    pub max_minutes: u64,
    /// `timer`: minimum seconds between two rule passes
    pub timer_secs: u64,
    /// `max.rdonly.fraction`
    pub max_read_only_fraction: f64,
    /// `flush.atonce`, 0 flushes everything pending
    pub flush_at_once: u32,
}

impl Default for AltParameters {
    fn default() -> Self {
        Self {
            max_files: 500,
            max_megabytes: 500 * 1024,
            max_minutes: 2 * 60,
            timer_secs: 60,
            max_read_only_fraction: 0.5,
            flush_at_once: 0,
        }
    }
}

impl AltParameters {
    /// Change one parameter. `Ok(false)` for keys this driver does not know.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "max.files" => self.max_files = parse_ranged(key, value, 0, MAX_VALUE)?,
            "max.megabytes" => self.max_megabytes = parse_ranged(key, value, 0, MAX_VALUE)?,
            "max.minutes" => self.max_minutes = parse_ranged(key, value, 0, MAX_VALUE)?,
            "timer" => self.timer_secs = parse_ranged(key, value, 0, MAX_VALUE)?,
            "flush.atonce" => self.flush_at_once = parse_ranged(key, value, 0, MAX_VALUE as u32)?,
            "max.rdonly.fraction" => {
                self.max_read_only_fraction = parse_ranged(key, value, 0.0, 1.0)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn effective(&self) -> BTreeMap<String, String> {
        [
            ("max.files", self.max_files.to_string()),
            ("max.megabytes", self.max_megabytes.to_string()),
            ("max.minutes", self.max_minutes.to_string()),
            ("timer", self.timer_secs.to_string()),
            ("max.rdonly.fraction", self.max_read_only_fraction.to_string()),
            ("flush.atonce", self.flush_at_once.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    fn max_precious_bytes(&self) -> u64 {
        self.max_megabytes.saturating_mul(MEGA_BYTES)
    }

    fn max_age_millis(&self) -> u64 {
        self.max_minutes.saturating_mul(MINUTE_MILLIS)
    }

    /// Backlog rank of a pool, 1.0 meaning "on average at the limits"
    pub fn metric(&self, pool: &HostPool, now_millis: i64) -> f64 {
        let space = pool.precious_space as f64 / self.max_precious_bytes().max(1) as f64;
        let files = pool.precious_file_count as f64 / self.max_files.max(1) as f64;
        let age = pool.age_millis(now_millis) as f64 / self.max_age_millis().max(1) as f64;
        (space + files + age) / 3.0
    }

    /// Whether any single limit is exceeded
    pub fn is_candidate(&self, pool: &HostPool, now_millis: i64) -> bool {
        pool.precious_space > self.max_precious_bytes()
            || pool.precious_file_count > self.max_files
            || pool.age_millis(now_millis) > self.max_age_millis()
    }
}

fn parse_ranged<T>(key: &str, value: &str, min: T, max: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display,
{
    let parsed: T = value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("value for {} not supported: {}", key, value)))?;
    if !(parsed >= min && parsed <= max) {
        return Err(Error::InvalidArgument(format!(
            "value for {} not in range {} <= n <= {}",
            key, min, max
        )));
    }
    Ok(parsed)
}

/// Parse `key=value` lines. Blank lines, `#` comments and lines with an
/// empty key or value are skipped.
pub fn parse_properties(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// Parameter file, read again whenever its modification time moves on
#[derive(Debug)]
struct ConfigFile {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigFile {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
        }
    }

    /// The file's properties if it changed since the last read. A missing
    /// file is not an error.
    fn read_if_newer(&mut self) -> Result<Option<BTreeMap<String, String>>> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified = metadata.modified()?;
        if self.last_modified.map_or(false, |last| modified <= last) {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        self.last_modified = Some(modified);
        Ok(Some(parse_properties(&content)))
    }
}

// =============================================================================
// Pools and Pool Sets
// =============================================================================

/// What the driver remembers per pool. Attached to the pool as its driver
/// handle.
#[derive(Debug, Default)]
pub struct HostPool {
    pub name: String,
    /// Pool set this pool belongs to, known once the pool reported its tags
    pub host_tag: Option<String>,
    /// Flush requests sent and not yet ended
    pub flush_counter: u32,
    pub precious_space: u64,
    pub precious_file_count: u64,
    /// Unix millis of the oldest pending file
    pub oldest_timestamp: i64,
    expected_read_only: bool,
    previous_was_read_only: bool,
}

impl HostPool {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn refresh(&mut self, pool: &Pool, now_millis: i64) {
        let cell_info = match pool.cell_info() {
            Some(info) => info,
            None => return,
        };
        let flush_infos = pool.flush_infos();
        self.precious_space = cell_info.precious_space;
        self.precious_file_count = flush_infos
            .iter()
            .map(|info| info.stats.request_count as u64)
            .sum();
        self.oldest_timestamp = flush_infos
            .iter()
            .map(|info| info.stats.oldest_file_timestamp)
            .filter(|ts| *ts > 0)
            .fold(now_millis, i64::min);
        if self.host_tag.is_none() {
            self.host_tag = Some(match cell_info.host_tag() {
                Some(host) => host.to_string(),
                None => format!("x-{}", self.name),
            });
        }
    }

    fn age_millis(&self, now_millis: i64) -> u64 {
        now_millis.saturating_sub(self.oldest_timestamp).max(0) as u64
    }

    pub fn is_flushing(&self) -> bool {
        self.flush_counter > 0
    }
}

/// Where a pool set is in its read-only, flush, read-write cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetProgress {
    Idle,
    WaitingForModeChange,
    WaitingForFlushDone,
}

impl std::fmt::Display for SetProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SetProgress::Idle => "Idle",
            SetProgress::WaitingForModeChange => "WaitingForModeChange",
            SetProgress::WaitingForFlushDone => "WaitingForFlushDone",
        };
        write!(f, "{}", s)
    }
}

/// Pools sharing a host
#[derive(Debug)]
pub struct PoolSet {
    pub name: String,
    pub members: BTreeSet<String>,
    pub progress: SetProgress,
    pub progress_started: Option<DateTime<Utc>>,
    expected_read_only: bool,
}

impl PoolSet {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: BTreeSet::new(),
            progress: SetProgress::Idle,
            progress_started: None,
            expected_read_only: false,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.progress != SetProgress::Idle
    }

    fn enter(&mut self, progress: SetProgress) {
        debug!(pool_set = %self.name, from = %self.progress, to = %progress, "Pool set progress");
        self.progress = progress;
        self.progress_started = Some(Utc::now());
    }
}

// =============================================================================
// Driver
// =============================================================================

/// The alternating flush policy
#[derive(Debug)]
pub struct AlternatingFlush {
    params: AltParameters,
    config_file: Option<ConfigFile>,
    suspended: bool,
    last_rules: Option<DateTime<Utc>>,
    pools: BTreeMap<String, Arc<Mutex<HostPool>>>,
    sets: BTreeMap<String, PoolSet>,
}

impl AlternatingFlush {
    /// Create the driver; recognised parameters in `args` become the
    /// initial settings
    pub fn new(args: &DriverArgs) -> Self {
        let mut driver = Self {
            params: AltParameters::default(),
            config_file: None,
            suspended: false,
            last_rules: None,
            pools: BTreeMap::new(),
            sets: BTreeMap::new(),
        };
        for (key, value) in &args.options {
            if key == CONFIG_FILE_OPTION {
                continue;
            }
            match driver.params.apply(key, value) {
                Ok(true) => {}
                Ok(false) => debug!(key = %key, "Load option not recognised"),
                Err(e) => debug!(key = %key, "Load option not applied: {}", e),
            }
        }
        driver
    }

    pub fn parameters(&self) -> &AltParameters {
        &self.params
    }

    pub fn pool_set(&self, name: &str) -> Option<&PoolSet> {
        self.sets.get(name)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn apply_properties(params: &mut AltParameters, properties: &BTreeMap<String, String>) {
        for (key, value) in properties {
            match params.apply(key, value) {
                Ok(true) => {}
                Ok(false) => debug!(key = %key, "Property not supported"),
                Err(e) => warn!(key = %key, "Property not applied: {}", e),
            }
        }
    }

    fn reload_config(&mut self) {
        let file = match self.config_file.as_mut() {
            Some(file) => file,
            None => return,
        };
        match file.read_if_newer() {
            Ok(Some(properties)) => {
                info!(path = %file.path.display(), "Driver config file changed, reloading");
                Self::apply_properties(&mut self.params, &properties);
            }
            Ok(None) => {}
            Err(e) => warn!(path = %file.path.display(), error = %e, "Driver config file not read"),
        }
    }

    /// The driver's record for `pool`, created and attached on first use
    fn host_pool(&mut self, pool: &Pool) -> Arc<Mutex<HostPool>> {
        if let Some(entry) = pool.driver_handle_as::<Mutex<HostPool>>() {
            return entry;
        }
        debug!(pool = %pool.name(), "Attaching driver state to pool");
        let entry = Arc::new(Mutex::new(HostPool::new(pool.name())));
        pool.set_driver_handle(&entry);
        self.pools.insert(pool.name().to_string(), entry.clone());
        entry
    }

    /// Refresh the record from an active pool and link it into its pool set
    fn refresh(&mut self, pool: &Pool, now_millis: i64) -> Arc<Mutex<HostPool>> {
        let entry = self.host_pool(pool);
        if !pool.is_active() {
            return entry;
        }
        let tag = {
            let mut entry = entry.lock();
            entry.refresh(pool, now_millis);
            entry.host_tag.clone()
        };
        if let Some(tag) = tag {
            let set = self
                .sets
                .entry(tag.clone())
                .or_insert_with(|| PoolSet::new(&tag));
            if set.members.insert(pool.name().to_string()) {
                info!(pool = %pool.name(), pool_set = %tag, "Pool joined pool set");
            }
        }
        entry
    }

    // -------------------------------------------------------------------------
    // Rule engine
    // -------------------------------------------------------------------------

    /// Pick the pool set to flush next and start it. Returns its name.
    fn process_rules(&mut self, core: &dyn FlushControlCore, now_millis: i64) -> Option<String> {
        let mut total_available = 0usize;
        let mut total_flushing = 0usize;
        let mut in_progress = 0usize;
        let mut read_only = BTreeSet::new();
        let mut candidates: Vec<(String, String, f64)> = Vec::new();

        for pool in core.configured_pools() {
            if !(pool.is_active() && pool.is_io_mode_known()) {
                continue;
            }
            let entry = self.refresh(&pool, now_millis);
            let entry = entry.lock();
            let tag = match &entry.host_tag {
                Some(tag) => tag.clone(),
                None => continue,
            };

            total_available += 1;
            if entry.is_flushing() {
                total_flushing += 1;
            }
            if pool.is_read_only() {
                read_only.insert(pool.name().to_string());
            }
            if self.sets.get(&tag).map_or(false, PoolSet::in_progress) {
                in_progress += 1;
                continue;
            }
            if self.params.is_candidate(&entry, now_millis) {
                let metric = self.params.metric(&entry, now_millis);
                candidates.push((pool.name().to_string(), tag, metric));
            }
        }
        debug!(
            total = total_available,
            read_only = read_only.len(),
            flushing = total_flushing,
            in_progress,
            candidates = candidates.len(),
            "Rule statistics"
        );

        if candidates.is_empty() {
            debug!("No candidates found");
            return None;
        }

        candidates.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let limit = (total_available as f64 * self.params.max_read_only_fraction) as usize;
        let best = candidates.iter().find_map(|(pool, tag, metric)| {
            let set = self.sets.get(tag)?;
            let potential = read_only.union(&set.members).count();
            if potential > limit {
                debug!(
                    pool = %pool,
                    pool_set = %tag,
                    potential,
                    total = total_available,
                    "Would be too many pools read-only"
                );
                None
            } else {
                debug!(pool = %pool, pool_set = %tag, metric, "Best candidate");
                Some(tag.clone())
            }
        });

        let best = match best {
            Some(best) => best,
            None => {
                debug!("No candidates found after all");
                return None;
            }
        };
        info!(pool_set = %best, "Flushing pool set");
        self.switch_set_mode(core, &best, true);
        Some(best)
    }

    /// Request `read_only` for every member, or their previous mode when
    /// switching back
    fn switch_set_mode(&mut self, core: &dyn FlushControlCore, tag: &str, read_only: bool) {
        let members = match self.sets.get_mut(tag) {
            Some(set) => {
                set.enter(SetProgress::WaitingForModeChange);
                set.expected_read_only = read_only;
                set.members.clone()
            }
            None => return,
        };

        for name in &members {
            let pool = match core.pool_by_name(name) {
                Some(pool) => pool,
                None => continue,
            };
            let entry = self.host_pool(&pool);
            let target = {
                let mut entry = entry.lock();
                if read_only {
                    entry.previous_was_read_only = pool.is_read_only();
                    entry.expected_read_only = true;
                } else {
                    entry.expected_read_only = entry.previous_was_read_only;
                }
                entry.expected_read_only
            };
            if let Err(e) = pool.set_read_only(target) {
                warn!(pool = %name, pool_set = %tag, "Mode change not requested: {}", e);
            }
        }
    }

    /// Flush every pending storage class of `pool` that is not flushing yet
    fn flush_pool(&self, pool: &Pool) -> u32 {
        let mut flushing = 0;
        for info in pool.flush_info_handles() {
            let pending = info
                .stats()
                .map(|s| s.total_pending_file_size)
                .unwrap_or(0);
            if pending == 0 || info.is_flushing() {
                continue;
            }
            match info.flush(self.params.flush_at_once) {
                Ok(()) => {
                    info!(pool = %pool.name(), storage_class = %info.name(), pending, "Flushing");
                    flushing += 1;
                }
                Err(e) => {
                    warn!(pool = %pool.name(), storage_class = %info.name(), "Problem flushing: {}", e);
                }
            }
        }
        flushing
    }

    fn active_members(&self, core: &dyn FlushControlCore, tag: &str) -> Vec<Pool> {
        self.sets
            .get(tag)
            .map(|set| {
                set.members
                    .iter()
                    .filter_map(|name| core.pool_by_name(name))
                    .filter(Pool::is_active)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Once every active member reports the expected mode, flush the set
    /// (going read-only) or return it to idle (going back)
    fn check_set_modes(&mut self, core: &dyn FlushControlCore, tag: &str) {
        let expected_read_only = match self.sets.get(tag) {
            Some(set) if set.progress == SetProgress::WaitingForModeChange => set.expected_read_only,
            _ => return,
        };
        let members = self.active_members(core, tag);
        let mode_ok = members
            .iter()
            .filter(|pool| {
                pool.is_io_mode_known()
                    && pool.driver_handle_as::<Mutex<HostPool>>().map_or(false, |entry| {
                        entry.lock().expected_read_only == pool.is_read_only()
                    })
            })
            .count();
        debug!(pool_set = %tag, total = members.len(), mode_ok, "Pool set modes");
        if mode_ok < members.len() {
            return;
        }

        if !expected_read_only {
            if let Some(set) = self.sets.get_mut(tag) {
                set.enter(SetProgress::Idle);
            }
            info!(pool_set = %tag, "Pool set back in write service");
            return;
        }

        let mut flushed = 0;
        for pool in &members {
            let count = self.flush_pool(pool);
            self.host_pool(pool).lock().flush_counter = count;
            if count > 0 {
                flushed += 1;
            }
        }
        if flushed > 0 {
            info!(pool_set = %tag, pools = flushed, "Pool set read-only, flushing");
            if let Some(set) = self.sets.get_mut(tag) {
                set.enter(SetProgress::WaitingForFlushDone);
            }
        } else {
            info!(pool_set = %tag, "Nothing to flush, switching back");
            self.switch_set_mode(core, tag, false);
        }
    }

    /// Switch the set back once no active member has a flush outstanding
    fn check_set_flushed(&mut self, core: &dyn FlushControlCore, tag: &str) {
        match self.sets.get(tag) {
            Some(set) if set.progress == SetProgress::WaitingForFlushDone => {}
            _ => return,
        }
        let members = self.active_members(core, tag);
        let done = members
            .iter()
            .filter(|pool| {
                pool.driver_handle_as::<Mutex<HostPool>>()
                    .map_or(true, |entry| !entry.lock().is_flushing())
            })
            .count();
        debug!(pool_set = %tag, total = members.len(), done, "Pool set flushing");
        if done < members.len() {
            return;
        }
        info!(pool_set = %tag, "Pool set flushed, switching back");
        self.switch_set_mode(core, tag, false);
    }

    fn io_mode_updated(&mut self, core: &dyn FlushControlCore, pool: &Pool) {
        if !pool.is_active() {
            debug!(pool = %pool.name(), "Mode of an inactive pool ignored");
            return;
        }
        let entry = self.refresh(pool, Utc::now().timestamp_millis());
        let (tag, expected) = {
            let entry = entry.lock();
            (entry.host_tag.clone(), entry.expected_read_only)
        };
        let tag = match tag {
            Some(tag) => tag,
            None => return,
        };
        let progress = self.sets.get(&tag).map(|set| set.progress);
        if progress != Some(SetProgress::WaitingForModeChange) {
            debug!(pool = %pool.name(), pool_set = %tag, "I/O mode arrived while not waiting for one");
            return;
        }
        if expected != pool.is_read_only() {
            warn!(
                pool = %pool.name(),
                pool_set = %tag,
                read_only = pool.is_read_only(),
                expected,
                "Unexpected I/O mode"
            );
            return;
        }
        self.check_set_modes(core, &tag);
    }

    fn flushing_done(&mut self, core: &dyn FlushControlCore, pool_name: &str) {
        let pool = match core.pool_by_name(pool_name) {
            Some(pool) => pool,
            None => {
                warn!(pool = %pool_name, "Flush ended on a pool that is not configured");
                return;
            }
        };
        if !pool.is_active() {
            warn!(pool = %pool_name, "Flush ended on an inactive pool, ignored");
            return;
        }
        let entry = self.host_pool(&pool);
        let (counter, tag) = {
            let mut entry = entry.lock();
            entry.flush_counter = entry.flush_counter.saturating_sub(1);
            (entry.flush_counter, entry.host_tag.clone())
        };
        if counter > 0 {
            return;
        }
        if let Some(tag) = tag {
            self.check_set_flushed(core, &tag);
        }
    }

    fn pool_removed(&mut self, core: &dyn FlushControlCore, name: &str) {
        let entry = match self.pools.remove(name) {
            Some(entry) => entry,
            None => return,
        };
        let tag = match entry.lock().host_tag.clone() {
            Some(tag) => tag,
            None => return,
        };
        let (empty, progress) = match self.sets.get_mut(&tag) {
            Some(set) => {
                set.members.remove(name);
                (set.members.is_empty(), set.progress)
            }
            None => return,
        };
        if empty {
            self.sets.remove(&tag);
            debug!(pool_set = %tag, "Pool set dissolved");
            return;
        }
        // the remaining members may have been waiting on this one
        match progress {
            SetProgress::WaitingForModeChange => self.check_set_modes(core, &tag),
            SetProgress::WaitingForFlushDone => self.check_set_flushed(core, &tag),
            SetProgress::Idle => {}
        }
    }

    fn timer(&mut self, core: &dyn FlushControlCore) {
        self.reload_config();
        if self.suspended {
            debug!("Flushing suspended");
            return;
        }
        let now = Utc::now();
        if let Some(last) = self.last_rules {
            // one second of slack for timer jitter
            let elapsed = (now - last).num_milliseconds() + 1000;
            if elapsed < (self.params.timer_secs * 1000) as i64 {
                return;
            }
        }
        self.last_rules = Some(now);
        self.process_rules(core, now.timestamp_millis());
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn flush_pool_set(&mut self, core: &dyn FlushControlCore, name: &str) -> Result<String> {
        match self.sets.get(name) {
            None => Err(Error::InvalidArgument(format!("PoolSet not found: {}", name))),
            Some(set) if set.in_progress() => {
                Err(Error::InvalidArgument(format!("PoolSet in progress: {}", name)))
            }
            Some(_) => {
                self.switch_set_mode(core, name, true);
                Ok(format!("Flushing pool set {}", name))
            }
        }
    }

    fn list_pools(&self, core: &dyn FlushControlCore, args: &DriverArgs) -> String {
        let mut out = String::new();
        if args.has_option("c") {
            for pool in core.configured_pools() {
                let _ = writeln!(
                    out,
                    "{} {} active={} phase={}",
                    pool.name(),
                    pool.mode_string(),
                    pool.is_active(),
                    pool.phase()
                );
            }
            return out;
        }

        let extended = args.has_option("e");
        let now = Utc::now().timestamp_millis();
        for (tag, set) in &self.sets {
            let _ = writeln!(out, ">>{}<< {}", tag, set.progress);
            for name in &set.members {
                let _ = write!(out, "     {}", name);
                if extended {
                    if let Some(entry) = self.pools.get(name) {
                        let entry = entry.lock();
                        let _ = write!(
                            out,
                            " flushing={} precious={} files={} metric={:.3}",
                            entry.flush_counter,
                            entry.precious_space,
                            entry.precious_file_count,
                            self.params.metric(&entry, now)
                        );
                    }
                }
                out.push('\n');
            }
        }
        out
    }
}

impl HsmControllable for AlternatingFlush {
    fn name(&self) -> &str {
        "alternating"
    }

    fn init(&mut self, core: &dyn FlushControlCore) -> Result<()> {
        let args = core.driver_args();
        info!(args = %args, "Alternating flush driver initiating");

        let now = Utc::now().timestamp_millis();
        for pool in core.configured_pools() {
            self.refresh(&pool, now);
            debug!(pool = %pool.name(), "init: pool registered");
        }

        if let Some(path) = args.option(CONFIG_FILE_OPTION).filter(|p| !p.is_empty()) {
            info!(path = %path, "Reading driver parameters from file");
            self.config_file = Some(ConfigFile::new(path));
            self.reload_config();
        }
        Ok(())
    }

    fn handle_event(&mut self, core: &dyn FlushControlCore, event: &DriverEvent) -> Result<()> {
        match event {
            DriverEvent::PoolSetupUpdated => debug!("Pool setup updated"),
            DriverEvent::ConfiguredPoolAdded { pool } => {
                let pool = core.pool_by_name(pool).ok_or_else(|| Error::PoolNotFound {
                    pool: pool.clone(),
                })?;
                self.refresh(&pool, Utc::now().timestamp_millis());
            }
            DriverEvent::ConfiguredPoolRemoved { pool } => {
                debug!(pool = %pool, "Configured pool removed");
                self.pool_removed(core, pool);
            }
            DriverEvent::PoolFlushInfoUpdated { pool } => {
                if let Some(pool) = core.pool_by_name(pool) {
                    if !pool.is_active() {
                        debug!(pool = %pool.name(), "Pool inactive");
                        return Ok(());
                    }
                    self.refresh(&pool, Utc::now().timestamp_millis());
                }
            }
            DriverEvent::IoMode(result) => {
                if let Some(pool) = core.pool_by_name(&result.pool) {
                    self.io_mode_updated(core, &pool);
                }
            }
            DriverEvent::Flush(outcome) => match &outcome.kind {
                FlushOutcomeKind::Acknowledged { .. } => {}
                FlushOutcomeKind::Done | FlushOutcomeKind::Failed { .. } => {
                    debug!(pool = %outcome.pool, storage_class = %outcome.storage_class, "Flush ended");
                    self.flushing_done(core, &outcome.pool);
                }
            },
            DriverEvent::PropertiesUpdated(_) => {}
            DriverEvent::Command(args) => {
                let answer = self.command(core, args)?;
                info!(command = %args, "Command returns: {}", answer);
            }
            DriverEvent::Timer => self.timer(core),
            DriverEvent::Reset => {
                info!("Resetting pool sets");
                for set in self.sets.values_mut() {
                    set.enter(SetProgress::Idle);
                }
                for entry in self.pools.values() {
                    entry.lock().flush_counter = 0;
                }
            }
        }
        Ok(())
    }

    fn command(&mut self, core: &dyn FlushControlCore, args: &DriverArgs) -> Result<String> {
        match args.argv(0) {
            None => Ok(String::new()),
            Some("dummy") => Ok(args.args[1..].join(" ")),
            Some("suspend") => {
                self.suspended = true;
                Ok("Flushing suspended".to_string())
            }
            Some("resume") => {
                self.suspended = false;
                Ok("Flushing resumed".to_string())
            }
            Some("list") | Some("ls") => Ok(self.list_pools(core, args)),
            Some("flush") if args.argv(1) == Some("poolset") => {
                let name = args.argv(2).ok_or_else(|| {
                    Error::InvalidArgument("usage: flush poolset <poolSetName>".to_string())
                })?;
                self.flush_pool_set(core, name)
            }
            Some(other) => Err(Error::InvalidArgument(format!("unknown command: {}", other))),
        }
    }

    fn properties_updated(&mut self, properties: &mut BTreeMap<String, String>) {
        Self::apply_properties(&mut self.params, properties);
        *properties = self.params.effective();
    }

    fn storage_info_details(&self, _storage_class: &str) -> BTreeMap<String, String> {
        let mut details = BTreeMap::new();
        details.insert("driver".to_string(), "alternating".to_string());
        details.insert("flush.atonce".to_string(), self.params.flush_at_once.to_string());
        details.insert(
            "max.rdonly.fraction".to_string(),
            self.params.max_read_only_fraction.to_string(),
        );
        details
    }

    fn prepare_unload(&mut self, core: &dyn FlushControlCore) {
        info!("Alternating flush driver unloading");
        for pool in core.configured_pools() {
            pool.clear_driver_handle();
        }
        self.pools.clear();
        self.sets.clear();
    }
}
