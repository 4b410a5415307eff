//! Prometheus metrics for the keystore operator
//!
//! # Exported metrics
//! - `eck_keystore_regenerations_total` (counter): keystores built, labeled by namespace/name.
//! - `eck_keystore_converged` (gauge): 1 once every node loaded the published keystore.
//! - `eck_remote_cluster_api_key_operations_total` (counter): API key calls labeled by operation.
//! - `eck_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `eck_reconcile_errors_total` (counter): reconcile errors labeled by kind.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels identifying one Elasticsearch cluster
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    /// "create", "update" or "invalidate"
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// See [`crate::error::Error::kind`]
    pub kind: String,
}

pub static KEYSTORE_REGENERATIONS_TOTAL: Lazy<Family<ClusterLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static KEYSTORE_CONVERGED: Lazy<Family<ClusterLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static API_KEY_OPERATIONS_TOTAL: Lazy<Family<OperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "eck_keystore_regenerations",
        "Number of keystores built and published",
        KEYSTORE_REGENERATIONS_TOTAL.clone(),
    );
    registry.register(
        "eck_keystore_converged",
        "Whether every node loaded the published keystore",
        KEYSTORE_CONVERGED.clone(),
    );
    registry.register(
        "eck_remote_cluster_api_key_operations",
        "Cross-cluster API key calls made against Elasticsearch",
        API_KEY_OPERATIONS_TOTAL.clone(),
    );
    registry.register(
        "eck_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "eck_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );

    registry
});

pub fn inc_keystore_regenerations(namespace: &str, name: &str) {
    KEYSTORE_REGENERATIONS_TOTAL
        .get_or_create(&ClusterLabels::new(namespace, name))
        .inc();
}

pub fn set_keystore_converged(namespace: &str, name: &str, converged: bool) {
    KEYSTORE_CONVERGED
        .get_or_create(&ClusterLabels::new(namespace, name))
        .set(i64::from(converged));
}

/// Drop the per-cluster series of a deleted cluster
pub fn forget_cluster(namespace: &str, name: &str) {
    let labels = ClusterLabels::new(namespace, name);
    KEYSTORE_REGENERATIONS_TOTAL.remove(&labels);
    KEYSTORE_CONVERGED.remove(&labels);
}

pub fn inc_api_key_operations(operation: &str) {
    API_KEY_OPERATIONS_TOTAL
        .get_or_create(&OperationLabels {
            operation: operation.to_string(),
        })
        .inc();
}

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&ReconcileLabels {
            controller: controller.to_string(),
        })
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            kind: kind.to_string(),
        })
        .inc();
}
