//! Prometheus metrics for the load balancer controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `cloud_lb_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `cloud_lb_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `cloud_lb_api_requests_total` (counter): cloud API calls labeled by operation and outcome.
//! - `cloud_lb_api_throttled_total` (counter): throttled cloud API responses labeled by region.
//! - `cloud_lb_governor_delay_seconds` (gauge): current rate governor delay labeled by region.
//! - `cloud_lb_instance_cache_refreshes_total` (counter): full instance listings.
//! - `cloud_lb_managed_load_balancers` (gauge): load balancers currently reconciled.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "service"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Controller name, e.g. "service"
    pub controller: String,
    /// Error kind/category, e.g. "kube", "validation", "cloud_throttled"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CloudApiLabels {
    /// API operation, e.g. "DescribeSecurityGroups"
    pub operation: String,
    /// "success", "throttled" or "error"
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RegionLabels {
    pub region: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~5.5min across 16 buckets; deletion passes can poll for minutes.
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking cloud API calls
pub static CLOUD_API_REQUESTS_TOTAL: Lazy<Family<CloudApiLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking throttled cloud API responses
pub static CLOUD_API_THROTTLED_TOTAL: Lazy<Family<RegionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the rate governor's current delay
pub static GOVERNOR_DELAY_SECONDS: Lazy<Family<RegionLabels, Gauge<f64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking full instance listings
pub static INSTANCE_CACHE_REFRESHES_TOTAL: Lazy<Counter<u64, AtomicU64>> =
    Lazy::new(Counter::default);

/// Gauge tracking load balancers with a live Service
pub static MANAGED_LOAD_BALANCERS: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "cloud_lb_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "cloud_lb_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "cloud_lb_api_requests_total",
        "Total number of cloud API requests by operation and outcome",
        CLOUD_API_REQUESTS_TOTAL.clone(),
    );
    registry.register(
        "cloud_lb_api_throttled_total",
        "Total number of throttled cloud API responses",
        CLOUD_API_THROTTLED_TOTAL.clone(),
    );
    registry.register(
        "cloud_lb_governor_delay_seconds",
        "Delay currently applied before cloud API calls in a region",
        GOVERNOR_DELAY_SECONDS.clone(),
    );
    registry.register(
        "cloud_lb_instance_cache_refreshes_total",
        "Total number of full instance listings",
        INSTANCE_CACHE_REFRESHES_TOTAL.clone(),
    );
    registry.register(
        "cloud_lb_managed_load_balancers",
        "Number of load balancers backing a LoadBalancer Service",
        MANAGED_LOAD_BALANCERS.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_cloud_api_request(operation: &str, outcome: &str) {
    let labels = CloudApiLabels {
        operation: operation.to_string(),
        outcome: outcome.to_string(),
    };
    CLOUD_API_REQUESTS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_cloud_api_throttle(region: &str) {
    let labels = RegionLabels {
        region: region.to_string(),
    };
    CLOUD_API_THROTTLED_TOTAL.get_or_create(&labels).inc();
}

pub fn set_governor_delay_seconds(region: &str, seconds: f64) {
    let labels = RegionLabels {
        region: region.to_string(),
    };
    GOVERNOR_DELAY_SECONDS.get_or_create(&labels).set(seconds);
}

pub fn inc_instance_cache_refresh() {
    INSTANCE_CACHE_REFRESHES_TOTAL.inc();
}

pub fn inc_managed_load_balancers() {
    MANAGED_LOAD_BALANCERS.inc();
}

pub fn dec_managed_load_balancers() {
    MANAGED_LOAD_BALANCERS.dec();
}
