//! Alternate Flush Driver
//!
//! Flushes one pool at a time while the others keep accepting writes. On
//! every timer tick the active, non-flushing pool with the highest precious
//! fraction (or, failing that, the highest pending file count) is switched
//! read-only and all of its pending storage classes are flushed. The pool
//! goes back to read-write once every flush it was asked for has ended.
//!
//! Properties: `mode` (`auto` | `manual`), `flush.count`,
//! `flush.percentage`, `flush.atonce`.

use super::args::DriverArgs;
use super::HsmControllable;
use crate::domain::ports::PoolCellInfo;
use crate::error::{Error, Result};
use crate::flush::{DriverEvent, FlushControlCore, FlushOutcomeKind, Pool};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_FLUSH_COUNT: u32 = 5;
pub const DEFAULT_FLUSH_PERCENTAGE: f64 = 0.5;

/// Whether the timer flushes on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Auto,
    Manual,
}

impl FlushMode {
    fn as_str(&self) -> &'static str {
        match self {
            FlushMode::Auto => "auto",
            FlushMode::Manual => "manual",
        }
    }
}

/// What the driver remembers per pool. Attached to the pool as its driver
/// handle.
#[derive(Debug, Default)]
pub struct PoolBook {
    pub name: String,
    /// Flush requests sent and not yet ended
    pub flush_counter: u32,
    /// An I/O mode answer arrived since init
    pub mode_ready: bool,
    /// Last space report of the pool
    pub cell_info: PoolCellInfo,
    pub precious_file_count: u64,
}

impl PoolBook {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn update(&mut self, pool: &Pool) {
        let cell_info = match pool.cell_info() {
            Some(info) => info,
            None => return,
        };
        self.cell_info = cell_info;
        self.precious_file_count = pool
            .flush_infos()
            .iter()
            .map(|info| info.stats.request_count as u64)
            .sum();
    }

    fn is_flushing(&self) -> bool {
        self.flush_counter > 0
    }
}

/// The alternate flush policy
#[derive(Debug)]
pub struct AlternateFlush {
    mode: FlushMode,
    count_to_flush: u32,
    percentage_to_flush: f64,
    flush_at_once: u32,
    books: BTreeMap<String, Arc<Mutex<PoolBook>>>,
}

impl AlternateFlush {
    /// Create the driver; recognised properties in `args` become the
    /// initial settings
    pub fn new(args: &DriverArgs) -> Self {
        let mut driver = Self {
            mode: FlushMode::Auto,
            count_to_flush: DEFAULT_FLUSH_COUNT,
            percentage_to_flush: DEFAULT_FLUSH_PERCENTAGE,
            flush_at_once: 0,
            books: BTreeMap::new(),
        };
        for (key, value) in &args.options {
            if let Err(e) = driver.apply_property(key, value) {
                debug!(key = %key, "Load option not applied: {}", e);
            }
        }
        driver
    }

    pub fn mode(&self) -> FlushMode {
        self.mode
    }

    /// Change a single setting. Invalid values leave the setting alone.
    fn apply_property(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "mode" => match value {
                "auto" => self.mode = FlushMode::Auto,
                "manual" => self.mode = FlushMode::Manual,
                _ => {}
            },
            "flush.count" => self.count_to_flush = parse_positive(key, value)?,
            "flush.atonce" => self.flush_at_once = parse_positive(key, value)?,
            "flush.percentage" => {
                let percentage: f64 = value.parse().map_err(|_| {
                    Error::InvalidArgument(format!("value for {} not supported: {}", key, value))
                })?;
                if percentage < 0.0 {
                    return Err(Error::InvalidArgument(format!(
                        "value for {} not supported: {}",
                        key, value
                    )));
                }
                self.percentage_to_flush = percentage;
            }
            _ => {
                return Err(Error::InvalidArgument(format!("unsupported property {}", key)));
            }
        }
        Ok(())
    }

    fn effective_properties(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        properties.insert("mode".to_string(), self.mode.as_str().to_string());
        properties.insert("flush.count".to_string(), self.count_to_flush.to_string());
        properties.insert(
            "flush.percentage".to_string(),
            self.percentage_to_flush.to_string(),
        );
        properties.insert("flush.atonce".to_string(), self.flush_at_once.to_string());
        properties
    }

    /// The driver's record for `pool`, created and attached on first use
    fn book(&mut self, pool: &Pool) -> Arc<Mutex<PoolBook>> {
        if let Some(book) = pool.driver_handle_as::<Mutex<PoolBook>>() {
            return book;
        }
        debug!(pool = %pool.name(), "Attaching driver state to pool");
        let mut book = PoolBook::new(pool.name());
        book.update(pool);
        let book = Arc::new(Mutex::new(book));
        pool.set_driver_handle(&book);
        self.books.insert(pool.name().to_string(), book.clone());
        book
    }

    /// Central decision: the pool to flush next, if any
    fn next_to_flush(&mut self, core: &dyn FlushControlCore) -> Option<Pool> {
        let mut candidates = Vec::new();
        for pool in core.configured_pools() {
            if !pool.is_active() {
                continue;
            }
            let book = self.book(&pool);
            if book.lock().is_flushing() {
                debug!(pool = %pool.name(), "Already flushing");
            } else {
                candidates.push((pool, book));
            }
        }

        // keep at least one pool to write on
        if candidates.len() < 2 {
            debug!(candidates = candidates.len(), "Not enough pools to write on");
            return None;
        }

        let mut highest_counter: Option<(usize, u64)> = None;
        let mut highest_percentage: Option<(usize, f64)> = None;
        for (idx, (_, book)) in candidates.iter().enumerate() {
            let book = book.lock();
            if highest_counter.map_or(true, |(_, c)| book.precious_file_count > c) {
                highest_counter = Some((idx, book.precious_file_count));
            }
            let percentage = book.cell_info.precious_fraction();
            if highest_percentage.map_or(true, |(_, p)| percentage > p) {
                highest_percentage = Some((idx, percentage));
            }
        }

        if let Some((idx, percentage)) = highest_percentage {
            if percentage > self.percentage_to_flush {
                debug!(pool = %candidates[idx].0.name(), percentage, "Highest precious fraction");
                return Some(candidates.swap_remove(idx).0);
            }
        }
        if let Some((idx, count)) = highest_counter {
            if count > self.count_to_flush as u64 {
                debug!(pool = %candidates[idx].0.name(), count, "Highest pending count");
                return Some(candidates.swap_remove(idx).0);
            }
        }
        None
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
            match info.flush(self.flush_at_once) {
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

    fn start_flush(&mut self, pool: &Pool) -> Result<u32> {
        let book = self.book(pool);
        pool.set_read_only(true)?;
        let flushing = self.flush_pool(pool);
        book.lock().flush_counter += flushing;
        Ok(flushing)
    }

    fn timer(&mut self, core: &dyn FlushControlCore) {
        if self.mode == FlushMode::Manual {
            debug!("Manual mode, timer ignored");
            return;
        }

        let mut seen = HashSet::new();
        while let Some(pool) = self.next_to_flush(core) {
            if !seen.insert(pool.name().to_string()) {
                break;
            }
            info!(pool = %pool.name(), "Good candidate to flush");
            if !self.book(&pool).lock().mode_ready {
                continue;
            }
            if let Err(e) = self.start_flush(&pool) {
                warn!(pool = %pool.name(), "Flush not started: {}", e);
                break;
            }
        }
    }

    fn flushing_done(&mut self, core: &dyn FlushControlCore, pool_name: &str) {
        let pool = match core.pool_by_name(pool_name) {
            Some(pool) => pool,
            None => {
                warn!(pool = %pool_name, "Flush ended on a pool that is not configured");
                return;
            }
        };

        let book = self.book(&pool);
        let mut book = book.lock();
        book.update(&pool);
        book.flush_counter = book.flush_counter.saturating_sub(1);
        if book.flush_counter == 0 {
            info!(pool = %pool_name, "Pool finished all flushing, setting back to read-write");
            if let Err(e) = pool.set_read_only(false) {
                warn!(pool = %pool_name, "Could not reset pool mode: {}", e);
            }
        }
    }

    fn list_pools(&self, core: &dyn FlushControlCore) -> String {
        let mut out = String::new();
        for pool in core.configured_pools() {
            let line = match pool.driver_handle_as::<Mutex<PoolBook>>() {
                Some(book) => {
                    let book = book.lock();
                    format!(
                        "{} {} active={} flushing={} precious={:.3} pending={}\n",
                        pool.name(),
                        pool.mode_string(),
                        pool.is_active(),
                        book.flush_counter,
                        book.cell_info.precious_fraction(),
                        book.precious_file_count
                    )
                }
                None => format!("{} {} (no driver state)\n", pool.name(), pool.mode_string()),
            };
            out.push_str(&line);
        }
        out
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(v) if v >= 1 => Ok(v),
        _ => Err(Error::InvalidArgument(format!(
            "value for {} not supported: {}",
            key, value
        ))),
    }
}

impl HsmControllable for AlternateFlush {
    fn name(&self) -> &str {
        "alternate"
    }

    fn init(&mut self, core: &dyn FlushControlCore) -> Result<()> {
        let args = core.driver_args();
        info!(args = %args, "Alternate flush driver initiating");

        // resetting the modes also reports the actual ones
        for pool in core.configured_pools() {
            self.book(&pool);
            match pool.set_read_only(false) {
                Ok(()) => debug!(pool = %pool.name(), "init: read-write requested"),
                Err(Error::ControlDisabled { .. }) => {
                    debug!(pool = %pool.name(), "init: control disabled, mode left alone")
                }
                Err(e) => return Err(e),
            }
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
                self.book(&pool);
                if core.is_controlled() {
                    pool.set_read_only(false)?;
                }
            }
            DriverEvent::ConfiguredPoolRemoved { pool } => {
                self.books.remove(pool);
                debug!(pool = %pool, "Configured pool removed");
            }
            DriverEvent::PoolFlushInfoUpdated { pool } => {
                if let Some(pool) = core.pool_by_name(pool) {
                    if !pool.is_active() {
                        debug!(pool = %pool.name(), "Pool inactive");
                        return Ok(());
                    }
                    self.book(&pool).lock().update(&pool);
                }
            }
            DriverEvent::IoMode(result) => {
                if let Some(pool) = core.pool_by_name(&result.pool) {
                    let book = self.book(&pool);
                    let mut book = book.lock();
                    book.mode_ready = true;
                    book.update(&pool);
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
                info!("Resetting flush counters");
                for book in self.books.values() {
                    book.lock().flush_counter = 0;
                }
            }
        }
        Ok(())
    }

    fn command(&mut self, core: &dyn FlushControlCore, args: &DriverArgs) -> Result<String> {
        match args.argv(0) {
            None => Ok(String::new()),
            Some("dummy") => Ok(args.args[1..].join(" ")),
            Some("list") | Some("ls") => Ok(self.list_pools(core)),
            Some("flush") => {
                let name = args
                    .argv(1)
                    .ok_or_else(|| Error::InvalidArgument("usage: flush <pool>".to_string()))?;
                let pool = core.pool_by_name(name).ok_or_else(|| Error::PoolNotFound {
                    pool: name.to_string(),
                })?;
                let flushing = self.start_flush(&pool)?;
                Ok(format!("Flushing {} storage classes on {}", flushing, name))
            }
            Some(other) => Err(Error::InvalidArgument(format!("unknown command: {}", other))),
        }
    }

    fn properties_updated(&mut self, properties: &mut BTreeMap<String, String>) {
        for (key, value) in properties.iter() {
            if let Err(e) = self.apply_property(key, value) {
                warn!(key = %key, "Property not applied: {}", e);
            }
        }
        *properties = self.effective_properties();
    }

    fn storage_info_details(&self, _storage_class: &str) -> BTreeMap<String, String> {
        let mut details = BTreeMap::new();
        details.insert("driver".to_string(), "alternate".to_string());
        details.insert("flush.atonce".to_string(), self.flush_at_once.to_string());
        details
    }

    fn prepare_unload(&mut self, core: &dyn FlushControlCore) {
        info!("Alternate flush driver unloading");
        for pool in core.configured_pools() {
            pool.clear_driver_handle();
        }
        self.books.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{PoolCommand, PoolMode, PoolReply, StorageClassFlushInfo};
    use crate::flush::control::DispatchInputs;
    use crate::flush::FlushControl;
    use crate::metrics::FlushMetrics;
    use std::collections::BTreeSet;

    fn core_with(pools: &[(&str, u64, u64)]) -> (Arc<FlushControl>, DispatchInputs) {
        let (control, inputs) = FlushControl::new(FlushMetrics::new().unwrap(), None);
        let names: BTreeSet<String> = pools.iter().map(|(n, _, _)| n.to_string()).collect();
        control.update_configured_pools(names);
        for (name, total, precious) in pools {
            control
                .handle_reply(PoolReply::FlushControlInfo {
                    pool: name.to_string(),
                    cell_info: PoolCellInfo {
                        total_space: *total,
                        precious_space: *precious,
                        ..Default::default()
                    },
                    flush_infos: vec![StorageClassFlushInfo {
                        request_count: 2,
                        total_pending_file_size: *precious,
                        ..StorageClassFlushInfo::new("osm", "raw")
                    }],
                })
                .unwrap();
            control
                .handle_reply(PoolReply::PoolMode {
                    pool: name.to_string(),
                    mode: PoolMode::from_read_only(false),
                })
                .unwrap();
        }
        (control, inputs)
    }

    fn drain(inputs: &mut DispatchInputs) -> Vec<(String, PoolCommand)> {
        let mut out = Vec::new();
        while let Ok(request) = inputs.requests.try_recv() {
            out.push((request.pool, request.command));
        }
        out
    }

    fn ready_driver(core: &FlushControl) -> AlternateFlush {
        let mut driver = AlternateFlush::new(&DriverArgs::default());
        driver.init(core).unwrap();
        for pool in core.configured_pool_names() {
            driver
                .handle_event(
                    core,
                    &DriverEvent::IoMode(crate::flush::IoModeResult {
                        pool,
                        mode: PoolMode::from_read_only(false),
                    }),
                )
                .unwrap();
        }
        driver
    }

    #[test]
    fn test_init_sets_pools_writable() {
        let (core, mut inputs) = core_with(&[("a", 100, 10), ("b", 100, 10)]);
        let _driver = ready_driver(&core);

        let requests = drain(&mut inputs);
        assert_eq!(
            requests,
            vec![
                ("a".to_string(), PoolCommand::SetMode { read_only: false }),
                ("b".to_string(), PoolCommand::SetMode { read_only: false }),
            ]
        );
        assert!(core.pool_by_name("a").unwrap().driver_handle().is_some());
    }

    #[test]
    fn test_flushes_highest_precious_fraction() {
        let (core, mut inputs) = core_with(&[("a", 100, 20), ("b", 100, 80), ("c", 100, 40)]);
        let mut driver = ready_driver(&core);
        drain(&mut inputs);

        driver.handle_event(core.as_ref(), &DriverEvent::Timer).unwrap();

        let requests = drain(&mut inputs);
        assert_eq!(
            requests,
            vec![
                ("b".to_string(), PoolCommand::SetMode { read_only: true }),
                (
                    "b".to_string(),
                    PoolCommand::Flush {
                        storage_class: "raw@osm".into(),
                        count: 0
                    }
                ),
            ]
        );
        let book = core.pool_by_name("b").unwrap().driver_handle_as::<Mutex<PoolBook>>().unwrap();
        assert_eq!(book.lock().flush_counter, 1);
        assert!((book.lock().cell_info.precious_fraction() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_needs_two_writable_pools() {
        let (core, mut inputs) = core_with(&[("a", 100, 90), ("b", 100, 80)]);
        let mut driver = ready_driver(&core);
        drain(&mut inputs);

        driver.handle_event(core.as_ref(), &DriverEvent::Timer).unwrap();
        assert_eq!(drain(&mut inputs).len(), 2);

        // "a" is flushing now, "b" alone must keep accepting writes
        driver.handle_event(core.as_ref(), &DriverEvent::Timer).unwrap();
        assert!(drain(&mut inputs).is_empty());
    }

    #[test]
    fn test_below_thresholds_nothing_flushed() {
        let (core, mut inputs) = core_with(&[("a", 100, 10), ("b", 100, 20)]);
        let mut driver = ready_driver(&core);
        drain(&mut inputs);

        driver.handle_event(core.as_ref(), &DriverEvent::Timer).unwrap();
        assert!(drain(&mut inputs).is_empty());
    }

    #[test]
    fn test_flush_done_restores_read_write() {
        let (core, mut inputs) = core_with(&[("a", 100, 90), ("b", 100, 10)]);
        let mut driver = ready_driver(&core);
        driver.handle_event(core.as_ref(), &DriverEvent::Timer).unwrap();
        drain(&mut inputs);

        let outcome = crate::flush::FlushOutcome {
            pool: "a".into(),
            storage_class: "raw@osm".into(),
            kind: FlushOutcomeKind::Failed {
                error_code: 3,
                message: "tape error".into(),
            },
        };
        driver
            .handle_event(core.as_ref(), &DriverEvent::Flush(outcome))
            .unwrap();
        assert_eq!(
            drain(&mut inputs),
            vec![("a".to_string(), PoolCommand::SetMode { read_only: false })]
        );
    }

    #[test]
    fn test_manual_mode_and_command_flush() {
        let (core, mut inputs) = core_with(&[("a", 100, 90), ("b", 100, 10)]);
        let mut driver = ready_driver(&core);
        let mut properties: BTreeMap<String, String> = [
            ("mode".to_string(), "manual".to_string()),
            ("flush.count".to_string(), "0".to_string()),
            ("colour".to_string(), "blue".to_string()),
        ]
        .into_iter()
        .collect();
        driver.properties_updated(&mut properties);

        assert_eq!(properties.get("mode").map(String::as_str), Some("manual"));
        assert_eq!(properties.get("flush.count").map(String::as_str), Some("5"));
        assert!(!properties.contains_key("colour"));
        drain(&mut inputs);

        driver.handle_event(core.as_ref(), &DriverEvent::Timer).unwrap();
        assert!(drain(&mut inputs).is_empty());

        let answer = driver
            .command(core.as_ref(), &DriverArgs::parse_line("flush b"))
            .unwrap();
        assert_eq!(answer, "Flushing 1 storage classes on b");
        assert_eq!(drain(&mut inputs).len(), 2);

        let listing = driver.command(core.as_ref(), &DriverArgs::parse_line("ls")).unwrap();
        assert!(listing.contains("b RW active=true flushing=1"));
        assert!(driver
            .command(core.as_ref(), &DriverArgs::parse_line("explode"))
            .is_err());
    }

    #[test]
    fn test_load_options_apply() {
        let driver = AlternateFlush::new(&DriverArgs::parse_line("-mode=manual -flush.atonce=3"));
        assert_eq!(driver.mode(), FlushMode::Manual);
        assert_eq!(driver.storage_info_details("raw@osm").get("flush.atonce").map(String::as_str), Some("3"));
    }
}
