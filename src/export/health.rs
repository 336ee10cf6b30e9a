use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "hostcollect";

/// Prometheus metrics describing the agent itself.
///
/// All metrics use the "hostcollect" namespace. The HTTP server is optional;
/// the registry is always populated so the counters can be read in-process.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Points handed to the output stream, by collector.
    pub datapoints_emitted: CounterVec,
    /// Points dropped because canonicalization failed.
    pub datapoints_rejected: Counter,
    /// Failed collector runs, by collector.
    pub collector_errors: CounterVec,
    /// Wall time of each collector run, by collector.
    pub collector_duration: HistogramVec,
    /// External program restarts, by program path.
    pub program_restarts: CounterVec,
    /// Malformed external program output lines.
    pub program_parse_errors: Counter,
    /// Live watched pids, by watch name.
    pub watched_processes: GaugeVec,
    /// Points waiting in the fan-in queue.
    pub dispatch_queue_length: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    ///
    /// An empty `addr` disables the HTTP server; `start` is then a no-op.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let datapoints_emitted = CounterVec::new(
            Opts::new(
                "datapoints_emitted_total",
                "Total datapoints handed to the output stream by collector.",
            )
            .namespace(NAMESPACE),
            &["collector"],
        )?;
        let datapoints_rejected = Counter::with_opts(
            Opts::new(
                "datapoints_rejected_total",
                "Total datapoints dropped because a name or tag failed cleaning.",
            )
            .namespace(NAMESPACE),
        )?;
        let collector_errors = CounterVec::new(
            Opts::new(
                "collector_errors_total",
                "Total failed collector runs by collector.",
            )
            .namespace(NAMESPACE),
            &["collector"],
        )?;
        let collector_duration = HistogramVec::new(
            HistogramOpts::new(
                "collector_duration_seconds",
                "Time spent in a single collector run.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0]),
            &["collector"],
        )?;
        let program_restarts = CounterVec::new(
            Opts::new(
                "program_restarts_total",
                "Total external program restarts by program.",
            )
            .namespace(NAMESPACE),
            &["program"],
        )?;
        let program_parse_errors = Counter::with_opts(
            Opts::new(
                "program_parse_errors_total",
                "Total malformed lines read from external programs.",
            )
            .namespace(NAMESPACE),
        )?;
        let watched_processes = GaugeVec::new(
            Opts::new(
                "watched_processes",
                "Number of live processes tracked per watch entry.",
            )
            .namespace(NAMESPACE),
            &["name"],
        )?;
        let dispatch_queue_length = Gauge::with_opts(
            Opts::new(
                "dispatch_queue_length",
                "Current number of datapoints waiting in the fan-in queue.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(datapoints_emitted.clone()))?;
        registry.register(Box::new(datapoints_rejected.clone()))?;
        registry.register(Box::new(collector_errors.clone()))?;
        registry.register(Box::new(collector_duration.clone()))?;
        registry.register(Box::new(program_restarts.clone()))?;
        registry.register(Box::new(program_parse_errors.clone()))?;
        registry.register(Box::new(watched_processes.clone()))?;
        registry.register(Box::new(dispatch_queue_length.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            datapoints_emitted,
            datapoints_rejected,
            collector_errors,
            collector_duration,
            program_restarts,
            program_parse_errors,
            watched_processes,
            dispatch_queue_length,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        if self.addr.is_empty() {
            tracing::debug!("health metrics server disabled");
            return Ok(());
        }

        // ":port" shorthand binds every interface.
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

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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
