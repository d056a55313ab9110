use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use tracing::{debug, warn};

use crate::{
    decision::{Action, Decision},
    decoy,
    error::ResolutionError,
    snapshot::RequestSnapshot,
};

/// Message served by a tarpit verdict that carries none.
pub const DEFAULT_TARPIT_MESSAGE: &str = "Please slow down.";

const JSON_CONTENT_TYPE: &str = "application/json";
const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Response synthesized in place of the protected application.
#[derive(Debug, Clone)]
pub struct SyntheticResponse {
    /// Status line.
    pub status: StatusCode,
    /// Headers to send.
    pub headers: HeaderMap,
    /// Body to send.
    pub body: String,
}

/// Terminal behavior for one request.
#[derive(Debug, Clone)]
pub enum EnforcementResult {
    /// Downstream handlers serve the request unmodified.
    Passthrough,
    /// The synthesized response is sent instead.
    Respond(SyntheticResponse),
}

impl EnforcementResult {
    /// True for pass-through.
    #[must_use]
    pub const fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough)
    }
}

/// Maps decisions onto concrete responses. Holds only static configuration.
#[derive(Debug, Clone)]
pub struct Enforcer {
    base_url: String,
    default_delay: Duration,
    placeholder: String,
}

impl Enforcer {
    /// Creates an enforcer resolving rooted redirect targets against `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, default_delay: Duration) -> Self {
        Self {
            base_url: base_url.into().trim().to_owned(),
            default_delay,
            placeholder: decoy::fake_table_dump(),
        }
    }

    /// Replaces the body served by fake-data verdicts that carry none.
    #[must_use]
    pub fn with_placeholder(mut self, body: impl Into<String>) -> Self {
        self.placeholder = body.into();
        self
    }

    /// Applies `decision`. Any resolution failure degrades to pass-through.
    pub async fn apply(&self, decision: &Decision, snapshot: &RequestSnapshot) -> EnforcementResult {
        let Decision::Verdict(verdict) = decision else {
            return EnforcementResult::Passthrough;
        };
        let resolved = match &verdict.action {
            Action::Allow => return EnforcementResult::Passthrough,
            Action::Redirect { target } => self.redirect(target.as_deref()),
            Action::FakeData { body, status } => self.fake_data(body.as_deref(), *status),
            Action::Tarpit {
                delay,
                status,
                message,
            } => {
                self.tarpit(delay.unwrap_or(self.default_delay), *status, message.as_deref())
                    .await
            }
        };
        match resolved {
            Ok(response) => EnforcementResult::Respond(response),
            Err(err) => {
                warn!(
                    error = %err,
                    action = verdict.action.label(),
                    path = snapshot.path(),
                    "verdict could not be enforced, passing through"
                );
                EnforcementResult::Passthrough
            }
        }
    }

    /// Turns a redirect target into an absolute URL.
    pub fn resolve_redirect(&self, target: Option<&str>) -> Result<String, ResolutionError> {
        let target = target
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ResolutionError::MissingTarget)?;
        if target.starts_with('/') {
            return Ok(format!("{}{target}", self.base_url.trim_end_matches('/')));
        }
        let lowered = target.to_ascii_lowercase();
        let rest = lowered
            .strip_prefix("http://")
            .or_else(|| lowered.strip_prefix("https://"));
        match rest {
            Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(target.to_owned()),
            _ => Err(ResolutionError::UnsupportedTarget(target.to_owned())),
        }
    }

    fn redirect(&self, target: Option<&str>) -> Result<SyntheticResponse, ResolutionError> {
        let location = self.resolve_redirect(target)?;
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, header_value(&location)?);
        Ok(SyntheticResponse {
            status: StatusCode::FOUND,
            headers,
            body: String::new(),
        })
    }

    fn fake_data(
        &self,
        body: Option<&str>,
        status: Option<u16>,
    ) -> Result<SyntheticResponse, ResolutionError> {
        let status = status_code(status)?;
        let body = body.unwrap_or(&self.placeholder);
        let content_type = if serde_json::from_str::<serde_json::Value>(body).is_ok() {
            JSON_CONTENT_TYPE
        } else {
            HTML_CONTENT_TYPE
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        Ok(SyntheticResponse {
            status,
            headers,
            body: body.to_owned(),
        })
    }

    /// Validates before sleeping so a bad verdict passes through without the delay.
    async fn tarpit(
        &self,
        delay: Duration,
        status: Option<u16>,
        message: Option<&str>,
    ) -> Result<SyntheticResponse, ResolutionError> {
        let status = status_code(status)?;
        let body = message.unwrap_or(DEFAULT_TARPIT_MESSAGE).to_owned();
        debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "tarpitting request");
        tokio::time::sleep(delay).await;
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_CONTENT_TYPE));
        Ok(SyntheticResponse {
            status,
            headers,
            body,
        })
    }
}

fn status_code(status: Option<u16>) -> Result<StatusCode, ResolutionError> {
    let raw = status.unwrap_or(200);
    StatusCode::from_u16(raw).map_err(|_| ResolutionError::InvalidStatus(raw))
}

fn header_value(raw: &str) -> Result<HeaderValue, ResolutionError> {
    HeaderValue::from_str(raw).map_err(|_| ResolutionError::InvalidHeader(raw.to_owned()))
}
