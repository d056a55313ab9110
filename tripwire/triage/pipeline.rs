use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::{json, Value};
use shared_logging::LogLevel;
use tracing::{debug, info, warn};

use crate::{
    config::TriageConfig,
    decision::{Action, Decision, VerdictRequest},
    enforcer::{EnforcementResult, Enforcer},
    metrics::TriageMetrics,
    oracle::{DecisionClient, DecisionOracle},
    prefilter::Prefilter,
    snapshot::RequestSnapshot,
    telemetry::TriageTelemetry,
};

/// Log message of the single record written per terminal outcome.
pub const OUTCOME_RECORD: &str = "triage.outcome";
/// Event type published for every suspect request.
pub const DECISION_EVENT: &str = "triage.decision";

/// How a request reached its terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Path matched a skip prefix; never classified.
    Skipped,
    /// Triage switched off; never classified.
    Disabled,
    /// Classified benign; the oracle was not consulted.
    Benign,
    /// Suspect, but the oracle gave no verdict.
    NoVerdict,
    /// Suspect, and the oracle allowed it.
    Allowed,
    /// Suspect, and a synthetic response replaced the application.
    Enforced,
    /// Suspect, but the verdict could not be enforced.
    Degraded,
}

impl Route {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Disabled => "disabled",
            Self::Benign => "benign",
            Self::NoVerdict => "no_verdict",
            Self::Allowed => "allowed",
            Self::Enforced => "enforced",
            Self::Degraded => "degraded",
        }
    }

    /// True when the oracle was consulted.
    #[must_use]
    pub const fn is_suspect(self) -> bool {
        matches!(
            self,
            Self::NoVerdict | Self::Allowed | Self::Enforced | Self::Degraded
        )
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Terminal outcome of one evaluation.
#[derive(Debug, Clone)]
pub struct TriageOutcome {
    /// Path taken through the pipeline.
    pub route: Route,
    /// Oracle decision, present only for suspect requests.
    pub decision: Option<Decision>,
    /// What the caller must do with the request.
    pub enforcement: EnforcementResult,
    /// Token that made the request suspect.
    pub matched_token: Option<String>,
    /// Time spent waiting for the oracle.
    pub oracle_latency: Option<Duration>,
    /// Total evaluation time, including any tarpit hold.
    pub elapsed: Duration,
}

impl TriageOutcome {
    /// Enforced action label, or `passthrough`.
    #[must_use]
    pub fn action_label(&self) -> &'static str {
        match (&self.enforcement, &self.decision) {
            (EnforcementResult::Respond(_), Some(decision)) => decision.label(),
            _ => "passthrough",
        }
    }

    /// True when downstream handlers serve the request.
    #[must_use]
    pub const fn is_passthrough(&self) -> bool {
        self.enforcement.is_passthrough()
    }
}

/// Assembles a [`TriagePipeline`].
pub struct TriagePipelineBuilder {
    prefilter: Prefilter,
    client: DecisionClient,
    enforcer: Enforcer,
    enabled: bool,
    skip_prefixes: Vec<String>,
    max_body_bytes: usize,
    telemetry: Option<TriageTelemetry>,
    metrics: Option<TriageMetrics>,
}

impl TriagePipelineBuilder {
    /// Turns triage on or off.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Path prefixes that bypass classification.
    #[must_use]
    pub fn skip_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_prefixes = prefixes
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.is_empty())
            .collect();
        self
    }

    /// Largest body buffered for inspection.
    #[must_use]
    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Attaches the outcome log and event publisher.
    #[must_use]
    pub fn telemetry(mut self, telemetry: TriageTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Attaches prometheus counters.
    #[must_use]
    pub fn metrics(mut self, metrics: TriageMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Finishes the pipeline.
    #[must_use]
    pub fn build(self) -> TriagePipeline {
        TriagePipeline {
            prefilter: self.prefilter,
            client: self.client,
            enforcer: self.enforcer,
            enabled: self.enabled,
            skip_prefixes: self.skip_prefixes,
            max_body_bytes: self.max_body_bytes,
            telemetry: self.telemetry,
            metrics: self.metrics,
        }
    }
}

/// Sequences prefilter, oracle and enforcer for each request.
///
/// Holds only read-only configuration and write-only sinks, so one instance is shared by every
/// concurrent evaluation. [`TriagePipeline::evaluate`] never fails.
pub struct TriagePipeline {
    prefilter: Prefilter,
    client: DecisionClient,
    enforcer: Enforcer,
    enabled: bool,
    skip_prefixes: Vec<String>,
    max_body_bytes: usize,
    telemetry: Option<TriageTelemetry>,
    metrics: Option<TriageMetrics>,
}

impl fmt::Debug for TriagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriagePipeline")
            .field("enabled", &self.enabled)
            .field("tokens", &self.prefilter.tokens())
            .field("deadline", &self.client.deadline())
            .field("skip_prefixes", &self.skip_prefixes)
            .finish_non_exhaustive()
    }
}

impl TriagePipeline {
    /// Starts a builder from the three core components.
    #[must_use]
    pub fn builder(
        prefilter: Prefilter,
        client: DecisionClient,
        enforcer: Enforcer,
    ) -> TriagePipelineBuilder {
        TriagePipelineBuilder {
            prefilter,
            client,
            enforcer,
            enabled: true,
            skip_prefixes: Vec::new(),
            max_body_bytes: 1024 * 1024,
            telemetry: None,
            metrics: None,
        }
    }

    /// Builder wired from `config` around `oracle`. Sinks are attached by the caller.
    #[must_use]
    pub fn from_config(
        config: &TriageConfig,
        oracle: Arc<dyn DecisionOracle>,
    ) -> TriagePipelineBuilder {
        Self::builder(
            Prefilter::new(&config.suspicion_tokens),
            DecisionClient::new(oracle, config.deadline()),
            Enforcer::new(config.redirect_base_url.clone(), config.tarpit_delay()),
        )
        .enabled(config.enabled)
        .skip_prefixes(config.skip_prefixes.iter().cloned())
        .max_body_bytes(config.max_body_bytes)
    }

    /// Largest body buffered for inspection.
    #[must_use]
    pub const fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// The prefilter in use.
    #[must_use]
    pub const fn prefilter(&self) -> &Prefilter {
        &self.prefilter
    }

    /// Route taken without classification, if `path` bypasses triage.
    #[must_use]
    pub fn bypass(&self, path: &str) -> Option<Route> {
        if !self.enabled {
            Some(Route::Disabled)
        } else if self.skip_prefixes.iter().any(|p| under_prefix(path, p)) {
            Some(Route::Skipped)
        } else {
            None
        }
    }

    /// Runs one request to its terminal outcome.
    pub async fn evaluate(&self, snapshot: &RequestSnapshot) -> TriageOutcome {
        let started = Instant::now();
        if let Some(route) = self.bypass(snapshot.path()) {
            return self.finish(
                route,
                snapshot,
                None,
                EnforcementResult::Passthrough,
                None,
                None,
                started,
            );
        }
        let Some(token) = self.prefilter.first_match(snapshot) else {
            return self.finish(
                Route::Benign,
                snapshot,
                None,
                EnforcementResult::Passthrough,
                None,
                None,
                started,
            );
        };
        let token = token.to_owned();
        debug!(token = %token, path = snapshot.path(), "request escalated to oracle");

        let consultation = self
            .client
            .request_verdict(VerdictRequest {
                source_address: snapshot.source_address().to_owned(),
                normalized_payload: snapshot.payload().to_owned(),
            })
            .await;
        let failure = match &consultation.decision {
            Decision::NoVerdict(cause) => Some(cause.label()),
            Decision::Verdict(_) => None,
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_oracle(consultation.latency.as_secs_f64(), failure);
        }

        let enforcement = self.enforcer.apply(&consultation.decision, snapshot).await;
        let route = match (&consultation.decision, &enforcement) {
            (Decision::NoVerdict(_), _) => Route::NoVerdict,
            (Decision::Verdict(v), _) if v.action == Action::Allow => Route::Allowed,
            (Decision::Verdict(_), EnforcementResult::Respond(_)) => Route::Enforced,
            (Decision::Verdict(_), EnforcementResult::Passthrough) => Route::Degraded,
        };
        self.finish(
            route,
            snapshot,
            Some(consultation.decision),
            enforcement,
            Some(token),
            Some(consultation.latency),
            started,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        route: Route,
        snapshot: &RequestSnapshot,
        decision: Option<Decision>,
        enforcement: EnforcementResult,
        matched_token: Option<String>,
        oracle_latency: Option<Duration>,
        started: Instant,
    ) -> TriageOutcome {
        let outcome = TriageOutcome {
            route,
            decision,
            enforcement,
            matched_token,
            oracle_latency,
            elapsed: started.elapsed(),
        };
        self.record(&outcome, snapshot);
        outcome
    }

    fn record(&self, outcome: &TriageOutcome, snapshot: &RequestSnapshot) {
        let action = outcome.action_label();
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(outcome.route.label(), action);
        }
        if outcome.route.is_suspect() {
            info!(
                route = %outcome.route,
                action,
                token = outcome.matched_token.as_deref().unwrap_or_default(),
                source = snapshot.source_address(),
                path = snapshot.path(),
                "triage outcome"
            );
        } else {
            debug!(route = %outcome.route, path = snapshot.path(), "triage outcome");
        }

        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let fields = outcome_fields(outcome, snapshot);
        let level = match outcome.route {
            Route::NoVerdict | Route::Degraded => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        if let Err(err) = telemetry.log(level, OUTCOME_RECORD, fields.clone()) {
            warn!(error = %err, "failed to write triage outcome record");
        }
        if outcome.route.is_suspect() {
            if let Err(err) = telemetry.event(DECISION_EVENT, fields) {
                warn!(error = %err, "failed to publish triage decision");
            }
        }
    }
}

fn outcome_fields(outcome: &TriageOutcome, snapshot: &RequestSnapshot) -> Value {
    let mut fields = json!({
        "route": outcome.route.label(),
        "action": outcome.action_label(),
        "method": snapshot.method(),
        "path": snapshot.path(),
        "source": snapshot.source_address(),
        "latency_ms": duration_ms(outcome.elapsed),
    });
    if let Some(token) = &outcome.matched_token {
        fields["matched_token"] = json!(token);
    }
    if let Some(latency) = outcome.oracle_latency {
        fields["oracle_latency_ms"] = json!(duration_ms(latency));
    }
    match &outcome.decision {
        Some(Decision::NoVerdict(cause)) => {
            fields["decision"] = json!("no_verdict");
            fields["cause"] = json!(cause.label());
        }
        Some(Decision::Verdict(verdict)) => {
            fields["decision"] = json!(verdict.action.label());
            if let Ok(diagnostics) = serde_json::to_value(&verdict.diagnostics) {
                if diagnostics.as_object().is_some_and(|d| !d.is_empty()) {
                    fields["diagnostics"] = diagnostics;
                }
            }
        }
        None => {}
    }
    fields
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

/// True when `path` equals `prefix` or continues it with a `/`.
fn under_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix.trim_end_matches('/'))
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
