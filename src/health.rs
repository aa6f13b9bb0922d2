//! Health probes and reconcile metrics
//!
//! `/healthz` answers as soon as the process runs. `/readyz` answers 200
//! once the controllers are started (and, with leader election, the lease
//! is held). `/metrics` exposes reconcile counters in the Prometheus text
//! format.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{info, warn};

use crate::{Error, Result};

/// Outcome of one reconcile, as counted by [`ReconcileMetrics`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Reconcile returned an action
    Success,
    /// Reconcile returned an error
    Error,
}

impl ReconcileOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Reconcile counters and durations per controller
#[derive(Clone)]
pub struct ReconcileMetrics {
    registry: Registry,
    reconciles: IntCounterVec,
    duration: HistogramVec,
}

impl ReconcileMetrics {
    /// Create the metric families in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let reconciles = IntCounterVec::new(
            Opts::new(
                "kloudlite_reconcile_total",
                "Reconcile cycles by controller and result",
            ),
            &["controller", "result"],
        )
        .map_err(metrics_error)?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "kloudlite_reconcile_duration_seconds",
                "Duration of one reconcile cycle",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["controller"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(reconciles.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            reconciles,
            duration,
        })
    }

    /// Count one reconcile of `controller`
    pub fn record(&self, controller: &str, outcome: ReconcileOutcome) {
        self.reconciles
            .with_label_values(&[controller, outcome.label()])
            .inc();
    }

    /// Record how long one cycle of `controller` took
    pub fn observe(&self, controller: &str, elapsed: Duration) {
        self.duration
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }

    /// Current count for `controller` and `outcome`
    pub fn count(&self, controller: &str, outcome: ReconcileOutcome) -> u64 {
        self.reconciles
            .with_label_values(&[controller, outcome.label()])
            .get()
    }

    /// Prometheus text exposition
    pub fn render(&self) -> String {
        match TextEncoder::new().encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode metrics");
                String::new()
            }
        }
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::internal_with_context("metrics", e.to_string())
}

/// State shared between the probes and the controllers
pub struct HealthState {
    ready: AtomicBool,
    /// Reconcile counters
    pub metrics: ReconcileMetrics,
}

impl HealthState {
    /// Not ready, with empty metrics
    pub fn new() -> Result<Self> {
        Ok(Self {
            ready: AtomicBool::new(false),
            metrics: ReconcileMetrics::new()?,
        })
    }

    /// Flip readiness
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Current readiness
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Router for the health probe address
pub fn probe_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Router for the metrics address
pub fn metrics_router(state: Arc<HealthState>) -> Router {
    Router::new().route("/metrics", get(metrics)).with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Serve `router` on `addr` until the process exits
pub async fn serve(addr: SocketAddr, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal_with_context("health", format!("bind {}: {}", addr, e)))?;
    info!(%addr, "serving");
    axum::serve(listener, router)
        .await
        .map_err(|e| Error::internal_with_context("health", e.to_string()))
}
