use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{OracleError, VerdictParseError};

/// The only information released to the oracle.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VerdictRequest {
    /// Best-effort client address.
    #[serde(rename = "src_ip")]
    pub source_address: String,
    /// Normalized payload.
    #[serde(rename = "payload")]
    pub normalized_payload: String,
}

/// Concrete enforcement requested by the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Serve the request normally.
    Allow,
    /// Send the client to a deception target.
    Redirect {
        /// Rooted path or absolute URL; `None` when the oracle omitted it.
        target: Option<String>,
    },
    /// Answer with synthetic data.
    FakeData {
        /// Body served verbatim; `None` selects the placeholder.
        body: Option<String>,
        /// Status code, 200 when absent.
        status: Option<u16>,
    },
    /// Hold the response, then answer.
    Tarpit {
        /// Hold time; the configured default when absent.
        delay: Option<Duration>,
        /// Status code, 200 when absent.
        status: Option<u16>,
        /// Response text; a generic slow-down message when absent.
        message: Option<String>,
    },
}

impl Action {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Redirect { .. } => "redirect",
            Self::FakeData { .. } => "fake_data",
            Self::Tarpit { .. } => "tarpit",
        }
    }
}

/// Oracle commentary carried for observability only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Classifier confidence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Why the oracle decided as it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Attack family, e.g. `Web Attack - Sql Injection`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_type: Option<String>,
}

/// A fully parsed, actionable oracle answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Requested enforcement.
    pub action: Action,
    /// Optional commentary.
    pub diagnostics: Diagnostics,
}

impl Verdict {
    /// Verdict without diagnostics.
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            diagnostics: Diagnostics::default(),
        }
    }
}

/// Why no actionable verdict is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoVerdictCause {
    /// Deadline elapsed.
    Timeout,
    /// Transport failure or non-success status.
    Transport(String),
    /// Body was not a well-formed verdict.
    Malformed(String),
}

impl NoVerdictCause {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
            Self::Malformed(_) => "malformed",
        }
    }
}

impl From<&OracleError> for NoVerdictCause {
    fn from(err: &OracleError) -> Self {
        match err {
            OracleError::Timeout(_) => Self::Timeout,
            OracleError::Transport(_) | OracleError::Status(_) => Self::Transport(err.to_string()),
            OracleError::Malformed(inner) => Self::Malformed(inner.to_string()),
        }
    }
}

/// Outcome of one oracle consultation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The oracle returned an actionable verdict.
    Verdict(Verdict),
    /// Anything short of a fully parsed verdict. Enforced exactly like `Allow`.
    NoVerdict(NoVerdictCause),
}

impl Decision {
    /// Stable label: the action name, or `no_verdict`.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Verdict(verdict) => verdict.action.label(),
            Self::NoVerdict(_) => "no_verdict",
        }
    }

    /// Parses an oracle response body. This is the only place oracle field names are read.
    ///
    /// The nested `action_result` object wins over a top-level descriptor; diagnostics come from a
    /// nested `decision` object or the top level.
    pub fn parse_oracle_response(body: &Value) -> Result<Verdict, VerdictParseError> {
        let root = body.as_object().ok_or(VerdictParseError::NotAnObject)?;
        let descriptor = match root.get("action_result") {
            Some(Value::Object(nested)) => nested,
            Some(Value::Null) | None => root,
            Some(_) => return Err(VerdictParseError::NotAnObject),
        };
        let action = parse_action(descriptor)?;
        let diagnostics = match root.get("decision") {
            Some(Value::Object(nested)) => parse_diagnostics(nested),
            _ => parse_diagnostics(root),
        };
        Ok(Verdict {
            action,
            diagnostics,
        })
    }

    /// Parses raw response bytes, folding JSON errors into [`VerdictParseError::InvalidJson`].
    pub fn parse_oracle_bytes(bytes: &[u8]) -> Result<Verdict, VerdictParseError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| VerdictParseError::InvalidJson(err.to_string()))?;
        Self::parse_oracle_response(&value)
    }
}

fn parse_action(descriptor: &Map<String, Value>) -> Result<Action, VerdictParseError> {
    let name = match descriptor.get("action") {
        Some(Value::String(name)) => name.trim().to_ascii_lowercase(),
        Some(Value::Null) | None => return Err(VerdictParseError::MissingAction),
        Some(other) => return Err(VerdictParseError::UnknownAction(other.to_string())),
    };
    match name.as_str() {
        "normal" | "allow" => Ok(Action::Allow),
        "redirect" | "redirect_honeypot" => Ok(Action::Redirect {
            target: optional_string(descriptor, "url")?,
        }),
        "fake_data" => Ok(Action::FakeData {
            body: fake_body(descriptor)?,
            status: optional_status(descriptor)?,
        }),
        "tarpit" | "tarpit_slowdown" | "delay" => Ok(Action::Tarpit {
            delay: optional_delay(descriptor)?,
            status: optional_status(descriptor)?,
            message: optional_string(descriptor, "message")?,
        }),
        _ => Err(VerdictParseError::UnknownAction(name)),
    }
}

fn parse_diagnostics(source: &Map<String, Value>) -> Diagnostics {
    Diagnostics {
        confidence: source.get("confidence").and_then(Value::as_f64),
        reason: source
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_owned),
        attack_type: source
            .get("attack_type")
            .and_then(Value::as_str)
            .map(str::to_owned),
    }
}

fn optional_string(
    descriptor: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, VerdictParseError> {
    match descriptor.get(field) {
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(invalid(field, format!("expected string, got {other}"))),
    }
}

/// `fake_payload` wins over `fake`; strings are served verbatim, objects and arrays serialized
/// compactly, and a bare `fake: true` flag selects the placeholder.
fn fake_body(descriptor: &Map<String, Value>) -> Result<Option<String>, VerdictParseError> {
    for field in ["fake_payload", "fake"] {
        match descriptor.get(field) {
            Some(Value::String(text)) => return Ok(Some(text.clone())),
            Some(value @ (Value::Object(_) | Value::Array(_))) => {
                return Ok(Some(value.to_string()));
            }
            Some(Value::Null | Value::Bool(_)) | None => {}
            Some(Value::Number(_)) => {
                return Err(invalid(field, "expected string, object or array".into()));
            }
        }
    }
    Ok(None)
}

fn optional_status(descriptor: &Map<String, Value>) -> Result<Option<u16>, VerdictParseError> {
    match descriptor.get("status") {
        Some(Value::Null) | None => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|raw| u16::try_from(raw).ok())
            .filter(|code| (100..=999).contains(code))
            .map(Some)
            .ok_or_else(|| invalid("status", format!("not an HTTP status: {value}"))),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn optional_delay(descriptor: &Map<String, Value>) -> Result<Option<Duration>, VerdictParseError> {
    match descriptor.get("delay_ms") {
        Some(Value::Null) | None => Ok(None),
        Some(value) => {
            if let Some(ms) = value.as_u64() {
                return Ok(Some(Duration::from_millis(ms)));
            }
            value
                .as_f64()
                .filter(|ms| ms.is_finite() && *ms >= 0.0)
                .map(|ms| Some(Duration::from_nanos((ms * 1_000_000.0).round() as u64)))
                .ok_or_else(|| invalid("delay_ms", format!("not a duration: {value}")))
        }
    }
}

fn invalid(field: &'static str, detail: String) -> VerdictParseError {
    VerdictParseError::InvalidField { field, detail }
}
