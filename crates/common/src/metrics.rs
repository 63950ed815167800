use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    fanout_requests: CounterVec,
    fanout_failures: CounterVec,
    rows_sent: CounterVec,
    rows_received: CounterVec,
    bytes_sent: CounterVec,
    bytes_received: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// One fan-out call issued (distribute/dispatch/collect/cluster op).
    pub fn inc_fanout(&self, operator: &str) {
        self.inner
            .fanout_requests
            .with_label_values(&[operator])
            .inc();
    }

    /// One fan-out call failed whole-call.
    pub fn inc_fanout_failure(&self, operator: &str) {
        self.inner
            .fanout_failures
            .with_label_values(&[operator])
            .inc();
    }

    /// Dataset traffic pushed to nodes.
    pub fn record_send(&self, operator: &str, rows: u64, bytes: u64) {
        let labels = [operator];
        self.inner
            .rows_sent
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .bytes_sent
            .with_label_values(&labels)
            .inc_by(bytes as f64);
    }

    /// Dataset traffic pulled back from nodes.
    pub fn record_receive(&self, operator: &str, rows: u64, bytes: u64) {
        let labels = [operator];
        self.inner
            .rows_received
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .bytes_received
            .with_label_values(&labels)
            .inc_by(bytes as f64);
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        let families = self.inner.registry.gather();
        let mut out = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8(out).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let fanout_requests = CounterVec::new(
            Opts::new("shf_fanout_requests_total", "Fan-out calls issued"),
            &["operator"],
        )
        .expect("metric opts");
        let fanout_failures = CounterVec::new(
            Opts::new("shf_fanout_failures_total", "Fan-out calls failed"),
            &["operator"],
        )
        .expect("metric opts");
        let rows_sent = CounterVec::new(
            Opts::new("shf_rows_sent_total", "Rows pushed to nodes"),
            &["operator"],
        )
        .expect("metric opts");
        let rows_received = CounterVec::new(
            Opts::new("shf_rows_received_total", "Rows pulled from nodes"),
            &["operator"],
        )
        .expect("metric opts");
        let bytes_sent = CounterVec::new(
            Opts::new("shf_bytes_sent_total", "Payload bytes pushed to nodes"),
            &["operator"],
        )
        .expect("metric opts");
        let bytes_received = CounterVec::new(
            Opts::new("shf_bytes_received_total", "Payload bytes pulled from nodes"),
            &["operator"],
        )
        .expect("metric opts");
        for metric in [
            &fanout_requests,
            &fanout_failures,
            &rows_sent,
            &rows_received,
            &bytes_sent,
            &bytes_received,
        ] {
            registry
                .register(Box::new(metric.clone()))
                .expect("register metric");
        }
        Self {
            registry,
            fanout_requests,
            fanout_failures,
            rows_sent,
            rows_received,
            bytes_sent,
            bytes_received,
        }
    }
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
