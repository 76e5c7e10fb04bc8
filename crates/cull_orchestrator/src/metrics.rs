use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Prometheus collectors for the reduction pipeline.
///
/// Wrapped in an `Arc` and shared by the orchestrator, its workers and the
/// store retry layer.
pub struct Metrics {
    pub registry: Registry,
    /// Points read by each stage.
    pub points_in_total: IntCounterVec,
    /// Points written by each stage.
    pub points_kept_total: IntCounterVec,
    pub chunks_written_total: IntCounterVec,
    /// Chunks found already present on resume.
    pub chunks_skipped_total: IntCounterVec,
    pub store_retries_total: IntCounter,
    /// Polygons dropped as degenerate while preparing geometry.
    pub degenerate_polygons_total: IntCounter,
    pub chunks_in_flight: IntGauge,
    pub stage_seconds: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("cull_orchestrator".into()), None)
            .expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric.expect("Invalid metric definition");
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            points_in_total: reg!(IntCounterVec::new(
                Opts::new("points_in_total", "Points read per stage"),
                &["stage"]
            )),
            points_kept_total: reg!(IntCounterVec::new(
                Opts::new("points_kept_total", "Points surviving each stage"),
                &["stage"]
            )),
            chunks_written_total: reg!(IntCounterVec::new(
                Opts::new("chunks_written_total", "Chunks written per stage"),
                &["stage"]
            )),
            chunks_skipped_total: reg!(IntCounterVec::new(
                Opts::new("chunks_skipped_total", "Chunks already present and skipped per stage"),
                &["stage"]
            )),
            store_retries_total: reg!(IntCounter::new(
                "store_retries_total",
                "Store operations retried after a transient failure"
            )),
            degenerate_polygons_total: reg!(IntCounter::new(
                "degenerate_polygons_total",
                "Polygons excluded from containment as degenerate"
            )),
            chunks_in_flight: reg!(IntGauge::new(
                "chunks_in_flight",
                "Chunks currently being processed"
            )),
            stage_seconds: reg!(HistogramVec::new(
                HistogramOpts::new("stage_seconds", "Wall time per stage")
                    .buckets(prometheus::exponential_buckets(0.1, 4.0, 8).unwrap_or_default()),
                &["stage"]
            )),
            registry,
        }
    }

    /// Serves the registry on `/metrics`.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let mut buffer = Vec::new();
                    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
                        Ok(()) => String::from_utf8_lossy(&buffer).into_owned().into_response(),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
                    }
                }
            }),
        )
    }

    /// Counts one chunk in flight until the guard drops, including when the
    /// chunk's future is dropped unfinished.
    pub fn chunk_in_flight(&self) -> InFlight<'_> {
        self.chunks_in_flight.inc();
        InFlight(&self.chunks_in_flight)
    }

    pub fn record_chunk(&self, stage: &str, points_in: usize, points_kept: usize) {
        self.points_in_total
            .with_label_values(&[stage])
            .inc_by(points_in as u64);
        self.points_kept_total
            .with_label_values(&[stage])
            .inc_by(points_kept as u64);
        self.chunks_written_total.with_label_values(&[stage]).inc();
    }

    pub fn record_skip(&self, stage: &str, chunks: usize) {
        if chunks > 0 {
            self.chunks_skipped_total
                .with_label_values(&[stage])
                .inc_by(chunks as u64);
        }
    }
}

pub struct InFlight<'a>(&'a IntGauge);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}
