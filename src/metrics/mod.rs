use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};

use crate::registry::BackendSnapshot;
use crate::status::BackendStatus;

#[derive(Clone)]
pub struct Metrics {
    pub requests_total: CounterVec,
    pub request_duration_seconds: HistogramVec,
    pub backend_up: GaugeVec,
    registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("hub_requests_total", "Requests forwarded to backends"),
            &["backend", "status"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            prometheus::histogram_opts!(
                "hub_request_duration_seconds",
                "Backend round-trip latency in seconds"
            ),
            &["backend"],
        )?;

        let backend_up = GaugeVec::new(
            Opts::new("hub_backend_up", "1 when the backend status is running"),
            &["backend"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(backend_up.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            backend_up,
            registry,
        })
    }

    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }

    pub fn record_request(&self, backend: &str, status: &str, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[backend, status])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration_secs);
    }

    pub fn observe_backends(&self, snapshots: &[BackendSnapshot]) {
        for snapshot in snapshots {
            let up = snapshot.status == BackendStatus::Running;
            self.backend_up
                .with_label_values(&[snapshot.id()])
                .set(if up { 1.0 } else { 0.0 });
        }
    }
}
