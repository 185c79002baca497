//! Prometheus metrics for the proxy core.
//!
//! All metrics are registered on a dedicated registry and exposed by the
//! HTTP endpoint in `stats_api`.

use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Client connections by final status
    pub static ref CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mirage_connections_total", "Total client connections by final status"),
        &["status"]
    ).unwrap();

    /// Currently active sessions
    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "mirage_connections_active",
        "Number of currently active sessions"
    ).unwrap();

    /// Relayed payload bytes by direction and datacenter
    pub static ref BYTES_TRANSFERRED: IntCounterVec = IntCounterVec::new(
        Opts::new("mirage_bytes_transferred_total", "Relayed payload bytes by direction and datacenter"),
        &["direction", "dc"]
    ).unwrap();

    /// Session duration histogram
    pub static ref CONNECTION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "mirage_connection_duration_seconds",
            "Session duration in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["dc"]
    ).unwrap();

    /// Session errors by kind
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mirage_errors_total", "Session errors by kind"),
        &["kind"]
    ).unwrap();

    /// Upstream connections by datacenter
    pub static ref DATACENTER_CONNECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("mirage_datacenter_connections", "Upstream connections by datacenter"),
        &["dc", "location"]
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(BYTES_TRANSFERRED.clone())).ok();
    REGISTRY.register(Box::new(CONNECTION_DURATION.clone())).ok();
    REGISTRY.register(Box::new(ERRORS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DATACENTER_CONNECTIONS.clone())).ok();
}

/// Bump `errors_total{kind}`.
pub fn record_error(kind: &'static str) {
    ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Record one upstream connection to `dc`.
pub fn record_datacenter_connection(dc: &crate::protocol::Datacenter) {
    DATACENTER_CONNECTIONS
        .with_label_values(&[dc.label(), dc.location])
        .inc();
}

/// Bump the per-direction relay counter.
pub fn record_transfer(direction: &'static str, dc_label: &str, bytes: u64) {
    BYTES_TRANSFERRED
        .with_label_values(&[direction, dc_label])
        .inc_by(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        init_metrics();
        init_metrics();

        record_error("replay");
        assert!(ERRORS_TOTAL.with_label_values(&["replay"]).get() >= 1);
    }

    #[test]
    fn test_transfer_counter_accumulates() {
        let before = BYTES_TRANSFERRED
            .with_label_values(&["client_to_peer", "DC9"])
            .get();
        record_transfer("client_to_peer", "DC9", 1024);
        let after = BYTES_TRANSFERRED
            .with_label_values(&["client_to_peer", "DC9"])
            .get();
        assert_eq!(after - before, 1024);
    }
}
