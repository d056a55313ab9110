//! Prometheus counters for triage outcomes and oracle health.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `tripwire_requests_total` | Counter | `route`, `action` |
//! | `tripwire_oracle_latency_seconds` | Histogram | `outcome` |
//! | `tripwire_oracle_failures_total` | Counter | `cause` |

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Latency buckets sized around the default 2 s deadline.
pub const ORACLE_LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];

/// Errors raised while registering or exporting metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A collector could not be registered.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),
    /// Text exposition failed.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result alias for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Triage counters registered on a shared registry. Cheap to clone.
#[derive(Clone)]
pub struct TriageMetrics {
    requests_total: CounterVec,
    oracle_latency: HistogramVec,
    oracle_failures_total: CounterVec,
}

impl std::fmt::Debug for TriageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriageMetrics").finish_non_exhaustive()
    }
}

impl TriageMetrics {
    /// Creates the collectors and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Fails when a collector with the same name is already registered.
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let requests_total = CounterVec::new(
            Opts::new(
                "tripwire_requests_total",
                "Requests by terminal route and enforced action",
            ),
            &["route", "action"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let oracle_latency = HistogramVec::new(
            HistogramOpts::new(
                "tripwire_oracle_latency_seconds",
                "Time spent waiting for the decision oracle",
            )
            .buckets(ORACLE_LATENCY_BUCKETS.to_vec()),
            &["outcome"],
        )?;
        registry.register(Box::new(oracle_latency.clone()))?;

        let oracle_failures_total = CounterVec::new(
            Opts::new(
                "tripwire_oracle_failures_total",
                "Oracle consultations that produced no verdict",
            ),
            &["cause"],
        )?;
        registry.register(Box::new(oracle_failures_total.clone()))?;

        Ok(Self {
            requests_total,
            oracle_latency,
            oracle_failures_total,
        })
    }

    /// Counts one terminal outcome.
    pub fn record_outcome(&self, route: &str, action: &str) {
        self.requests_total.with_label_values(&[route, action]).inc();
    }

    /// Records one oracle consultation. `failure` carries the no-verdict cause label.
    pub fn observe_oracle(&self, latency_secs: f64, failure: Option<&str>) {
        let outcome = if failure.is_some() { "no_verdict" } else { "verdict" };
        self.oracle_latency
            .with_label_values(&[outcome])
            .observe(latency_secs);
        if let Some(cause) = failure {
            self.oracle_failures_total.with_label_values(&[cause]).inc();
        }
    }

    /// Current value of `tripwire_requests_total{route,action}`.
    #[must_use]
    pub fn outcome_count(&self, route: &str, action: &str) -> f64 {
        self.requests_total.with_label_values(&[route, action]).get()
    }

    /// Current value of `tripwire_oracle_failures_total{cause}`.
    #[must_use]
    pub fn failure_count(&self, cause: &str) -> f64 {
        self.oracle_failures_total.with_label_values(&[cause]).get()
    }
}

/// Renders every collector in `registry` in the Prometheus text format.
///
/// # Errors
///
/// Fails when the encoder rejects a family or emits invalid UTF-8.
pub fn encode_text(registry: &Registry) -> MetricsResult<String> {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
}
