//! End-to-end flush control over the loopback transport

use assert_matches::assert_matches;
use hsm_flush_control::domain::ports::{PoolCellInfo, PoolCommand, PoolMode, PoolReply, StorageClassFlushInfo};
use hsm_flush_control::driver::{DriverArgs, DriverRegistry};
use hsm_flush_control::scheduler::{FlushScheduler, SchedulerConfig};
use hsm_flush_control::transport::LoopbackTransport;
use hsm_flush_control::Error;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn pending(pool: &Arc<LoopbackTransport>, name: &str, precious: u64, files: u32) {
    pool.set_cell_info(
        name,
        PoolCellInfo {
            total_space: 1000,
            precious_space: precious,
            free_space: 1000 - precious,
            ..Default::default()
        },
    );
    pool.set_storage_class(
        name,
        StorageClassFlushInfo {
            request_count: files,
            total_pending_file_size: precious,
            ..StorageClassFlushInfo::new("osm", "raw")
        },
    );
}

/// Two writer pools, pool-a far above the precious threshold
fn two_pools() -> Arc<LoopbackTransport> {
    let transport = LoopbackTransport::with_flush_delay(Duration::from_millis(20));
    transport.add_pool("pool-a", &["writers"]);
    transport.add_pool("pool-b", &["writers"]);
    pending(&transport, "pool-a", 800, 8);
    pending(&transport, "pool-b", 100, 1);
    transport
}

fn scheduler(transport: &Arc<LoopbackTransport>, config: SchedulerConfig) -> Arc<FlushScheduler> {
    let drivers = Arc::new(DriverRegistry::with_builtin_drivers());
    drivers
        .define("osm", "alternate", DriverArgs::new())
        .unwrap();

    let scheduler = FlushScheduler::new(config, transport.clone(), drivers, None).unwrap();
    transport.attach_reply_sink(scheduler.reply_sink());
    scheduler.load_driver("osm").unwrap();
    scheduler
}

fn writers() -> SchedulerConfig {
    SchedulerConfig {
        pool_groups: vec!["writers".into()],
        ..Default::default()
    }
}

/// Collect the pools, gain control, and wait until the driver is up and
/// both pool modes are known
async fn initialized(scheduler: &Arc<FlushScheduler>) {
    scheduler.refresh().await.unwrap();
    assert_eq!(scheduler.send_gain_control().unwrap(), 2);
    eventually("driver init", || scheduler.is_driver_initialized()).await;
    eventually("pool modes", || {
        scheduler
            .list_pools()
            .iter()
            .all(|pool| pool.io_mode_known && !pool.is_read_only)
    })
    .await;
    // let the driver consume the mode events queued behind the replies
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn flushes_sent(transport: &LoopbackTransport, pool: &str) -> usize {
    transport
        .sent_commands()
        .iter()
        .filter(|(address, command)| {
            address.as_str() == pool && matches!(command, PoolCommand::Flush { .. })
        })
        .count()
}

#[tokio::test]
async fn test_timer_flushes_fullest_pool() {
    let transport = two_pools();
    let scheduler = scheduler(&transport, writers());
    initialized(&scheduler).await;

    scheduler.timer();

    eventually("flush finished", || {
        transport
            .pool("pool-a")
            .map(|pool| pool.cell_info.precious_space == 0)
            .unwrap_or(false)
    })
    .await;
    eventually("pool-a back to read-write", || {
        let details = scheduler.pool_details("pool-a").unwrap();
        !details.is_read_only && details.flush_infos.iter().all(|info| !info.is_flushing)
    })
    .await;

    // pool-a went read-only before its flush and read-write afterwards
    let modes: Vec<bool> = transport
        .sent_commands()
        .into_iter()
        .filter(|(address, _)| address.as_str() == "pool-a")
        .filter_map(|(_, command)| match command {
            PoolCommand::SetMode { read_only } => Some(read_only),
            _ => None,
        })
        .collect();
    assert_eq!(modes.last(), Some(&false));
    assert!(modes.contains(&true));

    assert_eq!(flushes_sent(&transport, "pool-a"), 1);
    assert_eq!(flushes_sent(&transport, "pool-b"), 0);
    assert_eq!(scheduler.metrics().flush_requests.get(), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_failed_flush_returns_pool_to_read_write() {
    let transport = two_pools();
    transport.fail_flushes("pool-a", Some((42, "tape drive offline".into())));
    let scheduler = scheduler(&transport, writers());
    initialized(&scheduler).await;

    scheduler.timer();

    eventually("flush failure recorded", || {
        scheduler
            .pool_details("pool-a")
            .unwrap()
            .flush_infos
            .iter()
            .any(|info| info.flushing_error == 42)
    })
    .await;
    eventually("pool-a back to read-write", || {
        transport
            .pool("pool-a")
            .map(|pool| !pool.mode.is_read_only())
            .unwrap_or(false)
            && !scheduler.pool_details("pool-a").unwrap().is_read_only
    })
    .await;

    let details = scheduler.pool_details("pool-a").unwrap();
    let raw = &details.flush_infos[0];
    assert_eq!(raw.flushing_error_message.as_deref(), Some("tape drive offline"));
    assert!(!raw.is_flushing);
    assert_eq!(scheduler.metrics().flush_failures.get(), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_stale_reply_discarded() {
    let transport = two_pools();
    let scheduler = scheduler(&transport, writers());
    scheduler.refresh().await.unwrap();

    let result = scheduler.control().handle_reply(PoolReply::PoolMode {
        pool: "pool-gone".into(),
        mode: PoolMode::from_read_only(true),
    });
    assert_matches!(result, Err(Error::StaleReply { ref pool, .. }) if pool == "pool-gone");
    assert_eq!(scheduler.cell_info().failed, 1);
    assert_eq!(scheduler.metrics().stale_replies.get(), 1);

    // pushed through the sink, the reply is discarded the same way
    scheduler
        .reply_sink()
        .send(PoolReply::Unreachable {
            pool: "pool-gone".into(),
        })
        .unwrap();
    eventually("second stale reply", || scheduler.metrics().stale_replies.get() == 2).await;

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_pool_is_skipped() {
    let transport = two_pools();
    let scheduler = scheduler(&transport, writers());
    initialized(&scheduler).await;

    transport.set_reachable("pool-a", false);
    scheduler.send_gain_control().unwrap();
    eventually("pool-a inactive", || !scheduler.pool_details("pool-a").unwrap().is_active).await;

    // only pool-b is left to write on, so nothing is flushed
    scheduler.timer();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(flushes_sent(&transport, "pool-a"), 0);
    assert_eq!(flushes_sent(&transport, "pool-b"), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_driver_properties_and_commands() {
    let transport = two_pools();
    let scheduler = scheduler(&transport, writers());
    initialized(&scheduler).await;

    let properties: BTreeMap<String, String> = [
        ("mode".to_string(), "manual".to_string()),
        ("flush.count".to_string(), "2".to_string()),
        ("bogus".to_string(), "1".to_string()),
    ]
    .into_iter()
    .collect();
    scheduler.driver_properties(properties).unwrap();

    eventually("properties accepted", || {
        scheduler.cell_info().driver_properties_updated.is_some()
    })
    .await;
    let info = scheduler.cell_info();
    assert_eq!(info.driver_name.as_deref(), Some("alternate"));
    assert_eq!(info.driver_properties["mode"], "manual");
    assert_eq!(info.driver_properties["flush.count"], "2");
    assert!(!info.driver_properties.contains_key("bogus"));

    // manual mode: the timer leaves the pools alone
    scheduler.timer();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(flushes_sent(&transport, "pool-a"), 0);

    let listing = scheduler
        .driver_command(DriverArgs::parse_line("ls"))
        .await
        .unwrap();
    assert!(listing.contains("pool-a"));
    assert!(listing.contains("pool-b"));

    let answer = scheduler
        .driver_command(DriverArgs::parse_line("flush pool-b"))
        .await
        .unwrap();
    assert!(answer.contains("pool-b"));
    eventually("pool-b flushed", || {
        transport
            .pool("pool-b")
            .map(|pool| pool.cell_info.precious_space == 0)
            .unwrap_or(false)
    })
    .await;

    assert_matches!(
        scheduler.driver_command(DriverArgs::parse_line("rewind")).await,
        Err(Error::InvalidArgument(_))
    );

    let details = scheduler.storage_info_details("raw@osm").await.unwrap();
    assert_eq!(details.get("driver").map(String::as_str), Some("alternate"));
    assert_eq!(details.get("flush.atonce").map(String::as_str), Some("0"));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_run_loop_flushes_on_its_own() {
    let transport = two_pools();
    let config = SchedulerConfig {
        initial_delay: Duration::ZERO,
        timer_interval: Duration::from_millis(50),
        tick: Duration::from_millis(10),
        ..writers()
    };
    let scheduler = scheduler(&transport, config);
    let mut status = scheduler.subscribe_status();

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(scheduler.clone().run(cancel.clone()));

    eventually("pool-a flushed", || {
        transport
            .pool("pool-a")
            .map(|pool| pool.cell_info.precious_space == 0 && !pool.mode.is_read_only())
            .unwrap_or(false)
    })
    .await;

    let info = status.borrow_and_update().clone();
    assert_eq!(info.configured_pools, 2);
    assert_eq!(info.status, "OK");
    assert_eq!(flushes_sent(&transport, "pool-b"), 0);

    cancel.cancel();
    runner.await.unwrap();
    scheduler.shutdown().await;
    assert_eq!(scheduler.loaded_driver(), None);
}
