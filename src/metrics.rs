//! Prometheus metrics registry and instruments.
//!
//! Instruments are process-wide; handlers and workers update them directly.

use std::sync::Once;
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Inbound federation
    pub static ref ACTIVITIES_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedipost_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DISPATCH_OUTCOMES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedipost_dispatch_outcomes_total", "Inbound dispatch results"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedipost_signature_failures_total", "Rejected inbound signatures"),
        &["verdict"]
    ).expect("metric can be created");

    // Outbound federation
    pub static ref ACTIVITIES_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedipost_activities_sent_total", "Total number of outbound activities queued"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedipost_deliveries_total", "Delivery attempts by result"),
        &["result"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedipost_delivery_duration_seconds",
            "Signed inbox POST duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["result"]
    ).expect("metric can be created");
    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "fedipost_delivery_queue_depth",
        "Items waiting in the delivery queue"
    ).expect("metric can be created");
    pub static ref OUTBOUND_BACKLOG: IntGauge = IntGauge::new(
        "fedipost_outbound_backlog",
        "Outbound tasks submitted but not yet processed"
    ).expect("metric can be created");

    // Actor cache
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedipost_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedipost_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref ACTOR_FETCHES_TOTAL: IntCounter = IntCounter::new(
        "fedipost_actor_fetches_total",
        "Remote actor documents fetched"
    ).expect("metric can be created");

    // Application
    pub static ref STARTED_AT: Instant = Instant::now();
    pub static ref APP_UPTIME_SECONDS: Gauge = Gauge::new(
        "fedipost_app_uptime_seconds",
        "Application uptime in seconds"
    ).expect("metric can be created");

    // Errors
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedipost_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(register_all);
}

fn register_all() {
    lazy_static::initialize(&STARTED_AT);

    let collectors: Vec<(&str, Box<dyn Collector>)> = vec![
        ("activities_received", Box::new(ACTIVITIES_RECEIVED_TOTAL.clone())),
        ("dispatch_outcomes", Box::new(DISPATCH_OUTCOMES_TOTAL.clone())),
        ("signature_failures", Box::new(SIGNATURE_FAILURES_TOTAL.clone())),
        ("activities_sent", Box::new(ACTIVITIES_SENT_TOTAL.clone())),
        ("deliveries", Box::new(DELIVERIES_TOTAL.clone())),
        ("delivery_duration", Box::new(DELIVERY_DURATION_SECONDS.clone())),
        ("queue_depth", Box::new(QUEUE_DEPTH.clone())),
        ("outbound_backlog", Box::new(OUTBOUND_BACKLOG.clone())),
        ("cache_hits", Box::new(CACHE_HITS_TOTAL.clone())),
        ("cache_misses", Box::new(CACHE_MISSES_TOTAL.clone())),
        ("actor_fetches", Box::new(ACTOR_FETCHES_TOTAL.clone())),
        ("uptime", Box::new(APP_UPTIME_SECONDS.clone())),
        ("errors", Box::new(ERRORS_TOTAL.clone())),
    ];
    for (name, collector) in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::error!(metric = name, %error, "Failed to register metric");
        }
    }

    tracing::info!("Metrics registry initialized");
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    APP_UPTIME_SECONDS.set(STARTED_AT.elapsed().as_secs_f64());
    TextEncoder::new().encode_to_string(&REGISTRY.gather())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_renders_instruments() {
        init_metrics();
        init_metrics();
        QUEUE_DEPTH.set(3);
        let text = render().unwrap();
        assert!(text.contains("fedipost_delivery_queue_depth"));
        assert!(text.contains("fedipost_app_uptime_seconds"));
    }
}
