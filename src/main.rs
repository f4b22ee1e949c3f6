//! HSM Flush Control
//!
//! Runs the flush scheduler against the loopback pool simulation described
//! in the configuration file, with health, status and metrics endpoints.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hsm_flush_control::{
    AttractionRegistry, DriverRegistry, Error, FlushControlConfig, FlushScheduler,
    LoopbackTransport, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// HSM Flush Control - decides when pools flush precious files to tape
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "FLUSH_CONFIG")]
    config: Option<String>,

    /// Pool groups to control, in addition to the configured ones
    #[arg(long = "pool-group", env = "POOL_GROUPS", value_delimiter = ',')]
    pool_groups: Vec<String>,

    /// HSM type whose driver is loaded at startup
    #[arg(long, env = "FLUSH_SCHEDULER")]
    scheduler: Option<String>,

    /// Driver timer interval in seconds
    #[arg(long, env = "TIMER_SECS")]
    timer_secs: Option<u64>,

    /// Gain control interval in seconds
    #[arg(long, env = "GAIN_CONTROL_SECS")]
    gain_control_secs: Option<u64>,

    /// Pool group collection interval in seconds
    #[arg(long, env = "POOL_COLLECTION_SECS")]
    pool_collection_secs: Option<u64>,

    /// Observe pools without sending mode changes or flushes
    #[arg(long, env = "UNCONTROLLED")]
    uncontrolled: bool,

    /// Delay before a simulated flush completes, in milliseconds
    #[arg(long, env = "FLUSH_DELAY_MS", default_value = "50")]
    flush_delay_ms: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    info!("Starting HSM Flush Control");
    info!("  Version: {}", hsm_flush_control::VERSION);
    info!("  Cell: {}", config.cell_name);
    info!("  Pool groups: {:?}", config.pool_groups);
    info!("  Scheduler: {}", config.scheduler.as_deref().unwrap_or("none"));
    info!("  Controlled: {}", config.controlled);

    // Attractions and drivers
    let attractions = AttractionRegistry::new();
    config.register_attractions(&attractions)?;
    info!("Attraction registry initialized ({} pools)", attractions.len());

    let drivers = Arc::new(
        DriverRegistry::with_builtin_drivers().with_global_options(config.global_driver_options()),
    );
    config.define_drivers(&drivers)?;

    // Simulated pools
    let transport = LoopbackTransport::with_flush_delay(Duration::from_millis(args.flush_delay_ms));
    config.populate_loopback(&transport);

    let scheduler = FlushScheduler::new(
        config.scheduler_config(),
        transport.clone(),
        drivers,
        Some(attractions),
    )?;
    transport.attach_reply_sink(scheduler.reply_sink());

    if let Some(hsm_type) = &config.scheduler {
        scheduler.load_driver(hsm_type)?;
        info!("Driver loaded for hsm type {}", hsm_type);
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_scheduler = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_scheduler).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_scheduler = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_scheduler).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Log every status change
    let mut status = scheduler.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let info = status.borrow_and_update().clone();
            info!(status = %info, "Flush control status");
        }
    });

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(scheduler.clone().run(cancel.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");

    cancel.cancel();
    if let Err(e) = runner.await {
        warn!("Scheduler loop ended abnormally: {}", e);
    }
    scheduler.shutdown().await;

    info!("Flush control shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> Result<FlushControlConfig> {
    let mut config = match &args.config {
        Some(path) => FlushControlConfig::from_file(path)?,
        None => FlushControlConfig::default(),
    };

    for group in &args.pool_groups {
        if !config.pool_groups.contains(group) {
            config.pool_groups.push(group.clone());
        }
    }
    if let Some(scheduler) = &args.scheduler {
        config.scheduler = Some(scheduler.clone());
    }
    if let Some(secs) = args.timer_secs {
        config.timer_secs = secs;
    }
    if let Some(secs) = args.gain_control_secs {
        config.gain_control_interval_secs = secs;
    }
    if let Some(secs) = args.pool_collection_secs {
        config.pool_collection_interval_secs = secs;
    }
    if args.uncontrolled {
        config.controlled = false;
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, scheduler: Arc<FlushScheduler>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let scheduler = scheduler.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let scheduler = scheduler.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => Response::builder()
                            .status(StatusCode::OK)
                            .body(Body::from("ok"))
                            .unwrap(),
                        "/readyz" => {
                            let ready = scheduler.loaded_driver().is_none()
                                || scheduler.is_driver_initialized();
                            let status = if ready {
                                StatusCode::OK
                            } else {
                                StatusCode::SERVICE_UNAVAILABLE
                            };
                            Response::builder()
                                .status(status)
                                .body(Body::from(if ready { "ok" } else { "driver not initialized" }))
                                .unwrap()
                        }
                        "/status" => match scheduler.cell_info().to_json() {
                            Ok(json) => Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", "application/json")
                                .body(Body::from(json))
                                .unwrap(),
                            Err(e) => Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body(Body::from(e.to_string()))
                                .unwrap(),
                        },
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found"))
                            .unwrap(),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Internal(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, scheduler: Arc<FlushScheduler>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let scheduler = scheduler.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let scheduler = scheduler.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match scheduler.metrics().encode() {
                            Ok(text) => Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", "text/plain; version=0.0.4")
                                .body(Body::from(text))
                                .unwrap(),
                            Err(e) => Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body(Body::from(e.to_string()))
                                .unwrap(),
                        },
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found"))
                            .unwrap(),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Internal(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
