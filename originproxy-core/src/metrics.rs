//! Prometheus metrics for the data plane.
//!
//! Registered once at startup against an externally-owned [`Registry`] (the
//! metrics/health HTTP server lives in `originproxy-bin`, which scrapes this
//! registry — this module only defines and updates the series).

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    bytes_transferred: IntCounterVec,
    errors_total: IntCounterVec,
    connection_duration: HistogramVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "originproxy_connections_total",
                "Total number of connections handled, by route and mode",
            ),
            &["host", "mode"],
        )
        .expect("metric definition is well-formed");
        registry
            .register(Box::new(connections_total.clone()))
            .expect("metric name is unique");

        let connections_active = IntGauge::new(
            "originproxy_connections_active",
            "Number of connections currently being proxied",
        )
        .expect("metric definition is well-formed");
        registry
            .register(Box::new(connections_active.clone()))
            .expect("metric name is unique");

        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "originproxy_bytes_transferred_total",
                "Total bytes transferred, by route and direction",
            ),
            &["host", "direction"],
        )
        .expect("metric definition is well-formed");
        registry
            .register(Box::new(bytes_transferred.clone()))
            .expect("metric name is unique");

        let errors_total = IntCounterVec::new(
            Opts::new(
                "originproxy_errors_total",
                "Total number of handler errors, by kind",
            ),
            &["kind"],
        )
        .expect("metric definition is well-formed");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("metric name is unique");

        let connection_duration = HistogramVec::new(
            HistogramOpts::new(
                "originproxy_connection_duration_seconds",
                "Connection lifetime in seconds, by route",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["host"],
        )
        .expect("metric definition is well-formed");
        registry
            .register(Box::new(connection_duration.clone()))
            .expect("metric name is unique");

        Self {
            connections_total,
            connections_active,
            bytes_transferred,
            errors_total,
            connection_duration,
        }
    }

    pub fn connection_opened(&self, host: &str, mode: &str) -> ConnectionGuard<'_> {
        self.connections_total.with_label_values(&[host, mode]).inc();
        self.connections_active.inc();
        ConnectionGuard {
            metrics: self,
            host: host.to_string(),
            timer: std::time::Instant::now(),
        }
    }

    /// Called from the tunnel's and the replace-wrapped stream's copy loops
    /// once per chunk forwarded; `direction` is `"upstream"` or
    /// `"downstream"`.
    pub fn record_bytes(&self, host: &str, direction: &str, count: u64) {
        self.bytes_transferred.with_label_values(&[host, direction]).inc_by(count);
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }
}

/// Decrements the active-connection gauge and records the connection's
/// lifetime when dropped, regardless of which exit path the handler took.
pub struct ConnectionGuard<'a> {
    metrics: &'a Metrics,
    host: String,
    timer: std::time::Instant,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.metrics.connections_active.dec();
        self.metrics
            .connection_duration
            .with_label_values(&[&self.host])
            .observe(self.timer.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_panicking_and_tracks_active_count() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry);
        {
            let _guard = metrics.connection_opened("a.example", "stream");
            assert_eq!(metrics.connections_active.get(), 1);
        }
        assert_eq!(metrics.connections_active.get(), 0);
    }

    #[test]
    fn record_bytes_and_errors_do_not_panic() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry);
        metrics.record_bytes("a.example", "upstream", 1024);
        metrics.record_error("route-miss");
    }
}
