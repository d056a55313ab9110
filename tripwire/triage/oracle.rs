use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::{
    decision::{Decision, NoVerdictCause, Verdict, VerdictRequest},
    error::OracleError,
};

/// Transport seam for the remote decision oracle.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// Performs a single consultation. Implementations must not retry.
    async fn consult(&self, request: VerdictRequest) -> Result<Verdict, OracleError>;
}

/// JSON-over-HTTP oracle client posting `{src_ip, payload}`.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    client: Client,
    endpoint: String,
}

impl HttpOracle {
    /// Creates a client for `endpoint`. `request_timeout` bounds calls that outlive the caller's
    /// deadline and keep running detached.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent("tripwire-triage/0.1")
            .timeout(request_timeout)
            .build()
            .context("building oracle http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Target endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DecisionOracle for HttpOracle {
    async fn consult(&self, request: VerdictRequest) -> Result<Verdict, OracleError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Status(status.as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        Ok(Decision::parse_oracle_bytes(&body)?)
    }
}

/// What a consultation produced, with the time it took.
#[derive(Debug, Clone)]
pub struct Consultation {
    /// Parsed verdict or `NoVerdict`.
    pub decision: Decision,
    /// Time from dispatch until the decision was available.
    pub latency: Duration,
}

/// Bounded-time wrapper around a [`DecisionOracle`]. Never fails: every failure is a
/// [`Decision::NoVerdict`].
#[derive(Clone)]
pub struct DecisionClient {
    oracle: Arc<dyn DecisionOracle>,
    deadline: Duration,
}

impl std::fmt::Debug for DecisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionClient")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl DecisionClient {
    /// Wraps `oracle` with the default per-request deadline.
    #[must_use]
    pub fn new(oracle: Arc<dyn DecisionOracle>, deadline: Duration) -> Self {
        Self { oracle, deadline }
    }

    /// Default deadline.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Consults the oracle once under the default deadline.
    pub async fn request_verdict(&self, request: VerdictRequest) -> Consultation {
        self.request_verdict_within(request, self.deadline).await
    }

    /// Consults the oracle once under `deadline`.
    ///
    /// The call runs as its own task. When the deadline elapses first the task is left to finish
    /// in the background and its result is dropped; no replacement call is made.
    pub async fn request_verdict_within(
        &self,
        request: VerdictRequest,
        deadline: Duration,
    ) -> Consultation {
        let started = Instant::now();
        let oracle = Arc::clone(&self.oracle);
        let call = tokio::spawn(async move { oracle.consult(request).await });
        let outcome = match tokio::time::timeout(deadline, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(OracleError::Transport(format!(
                "oracle task failed: {join_err}"
            ))),
            Err(_) => Err(OracleError::Timeout(deadline)),
        };
        let latency = started.elapsed();
        let decision = match outcome {
            Ok(verdict) => Decision::Verdict(verdict),
            Err(err) => {
                debug!(error = %err, cause = err.label(), "oracle consultation yielded no verdict");
                Decision::NoVerdict(NoVerdictCause::from(&err))
            }
        };
        Consultation { decision, latency }
    }
}
