//! Flush Control Metrics
//!
//! Prometheus counters and gauges for requests sent to pools, replies
//! received and flush outcomes. Each instance owns its own registry so that
//! several schedulers (and tests) can coexist in one process.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics collected by the flush control core
#[derive(Clone)]
pub struct FlushMetrics {
    registry: Registry,
    /// Requests handed to the transport, by command
    pub requests: IntCounterVec,
    /// Requests the transport failed to deliver, by command
    pub request_failures: IntCounterVec,
    /// Replies applied, by kind
    pub replies: IntCounterVec,
    /// Replies for pools that are no longer configured
    pub stale_replies: IntCounter,
    /// Flush requests issued by drivers or operators
    pub flush_requests: IntCounter,
    /// Flush requests that ended in failure
    pub flush_failures: IntCounter,
    /// Pools currently under flush control
    pub configured_pools: IntGauge,
}

impl std::fmt::Debug for FlushMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushMetrics")
            .field("flush_requests", &self.flush_requests.get())
            .field("stale_replies", &self.stale_replies.get())
            .finish()
    }
}

impl FlushMetrics {
    /// Create and register all metrics on a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("hsm_flush_control".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("pool_requests_total", "Requests sent to pools"),
            &["command"],
        )?;
        let request_failures = IntCounterVec::new(
            Opts::new("pool_request_failures_total", "Requests the transport failed to deliver"),
            &["command"],
        )?;
        let replies = IntCounterVec::new(
            Opts::new("pool_replies_total", "Replies applied to pool state"),
            &["kind"],
        )?;
        let stale_replies = IntCounter::new(
            "stale_replies_total",
            "Replies discarded because the pool is no longer configured",
        )?;
        let flush_requests = IntCounter::new("flush_requests_total", "Flush requests issued")?;
        let flush_failures = IntCounter::new("flush_failures_total", "Flush requests that failed")?;
        let configured_pools = IntGauge::new("configured_pools", "Pools under flush control")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_failures.clone()))?;
        registry.register(Box::new(replies.clone()))?;
        registry.register(Box::new(stale_replies.clone()))?;
        registry.register(Box::new(flush_requests.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(configured_pools.clone()))?;

        Ok(Self {
            registry,
            requests,
            request_failures,
            replies,
            stale_replies,
            flush_requests,
            flush_failures,
            configured_pools,
        })
    }

    /// The registry these metrics live in
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
