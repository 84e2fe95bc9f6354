use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::tracer::stats::Outcome;

/// Prometheus metrics for the monitor.
///
/// All metrics use the "blockmon" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total lines read from the trace stream.
    pub events_received: Counter,
    /// Lines by ingest outcome (matched/foreign_device/malformed/dropped).
    pub events_by_outcome: CounterVec,
    /// Parsed events by tracepoint name.
    pub events_by_type: CounterVec,
    /// Live records in the tracker.
    pub tracker_records: Gauge,
    /// Records removed by the age sweep.
    pub tracker_evictions: Counter,
    /// Grid cells with any activity in the last frame.
    pub heatmap_active_cells: Gauge,
    /// Snapshot + projection + draw time per frame.
    pub frame_duration: Histogram,
    /// Age sweep time per tick.
    pub age_sweep_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total lines read from the trace stream.",
            )
            .namespace("blockmon"),
        )?;
        let events_by_outcome = CounterVec::new(
            Opts::new(
                "events_by_outcome_total",
                "Total trace lines by ingest outcome.",
            )
            .namespace("blockmon"),
            &["outcome"],
        )?;
        let events_by_type = CounterVec::new(
            Opts::new(
                "events_by_type_total",
                "Total parsed block events by tracepoint name.",
            )
            .namespace("blockmon"),
            &["event"],
        )?;
        let tracker_records = Gauge::with_opts(
            Opts::new("tracker_records", "Live block records in the tracker.")
                .namespace("blockmon"),
        )?;
        let tracker_evictions = Counter::with_opts(
            Opts::new(
                "tracker_evictions_total",
                "Total block records evicted by aging.",
            )
            .namespace("blockmon"),
        )?;
        let heatmap_active_cells = Gauge::with_opts(
            Opts::new(
                "heatmap_active_cells",
                "Grid cells with activity in the last frame.",
            )
            .namespace("blockmon"),
        )?;
        let frame_duration = Histogram::with_opts(
            HistogramOpts::new(
                "frame_duration_seconds",
                "Time to snapshot, project and draw one frame.",
            )
            .namespace("blockmon")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        let age_sweep_duration = Histogram::with_opts(
            HistogramOpts::new(
                "age_sweep_duration_seconds",
                "Time to age every tracker record once.",
            )
            .namespace("blockmon")
            .buckets(vec![0.00001, 0.0001, 0.001, 0.005, 0.01, 0.05]),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_by_outcome.clone()))?;
        registry.register(Box::new(events_by_type.clone()))?;
        registry.register(Box::new(tracker_records.clone()))?;
        registry.register(Box::new(tracker_evictions.clone()))?;
        registry.register(Box::new(heatmap_active_cells.clone()))?;
        registry.register(Box::new(frame_duration.clone()))?;
        registry.register(Box::new(age_sweep_duration.clone()))?;

        // Pre-create outcome series so they export as zero before the first event.
        for outcome in Outcome::ALL {
            events_by_outcome.with_label_values(&[outcome.as_str()]);
        }

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_by_outcome,
            events_by_type,
            tracker_records,
            tracker_evictions,
            heatmap_active_cells,
            frame_duration,
            age_sweep_duration,
        })
    }

    /// Counter for one ingest outcome.
    pub fn outcome_counter(&self, outcome: Outcome) -> Counter {
        self.events_by_outcome
            .with_label_values(&[outcome.as_str()])
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address (useful when binding port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Encode all registered metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
