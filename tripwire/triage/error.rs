use std::time::Duration;

use thiserror::Error;

/// Failures while consulting the decision oracle. None of these escape the decision client; they
/// are folded into [`crate::decision::NoVerdictCause`].
#[derive(Debug, Error)]
pub enum OracleError {
    /// The deadline elapsed before a response arrived.
    #[error("oracle deadline of {0:?} elapsed")]
    Timeout(Duration),
    /// Connection refused, reset, or any other transport failure.
    #[error("oracle transport error: {0}")]
    Transport(String),
    /// The oracle answered with a non-success HTTP status.
    #[error("oracle answered with status {0}")]
    Status(u16),
    /// The response body could not be parsed into a verdict.
    #[error("malformed oracle response: {0}")]
    Malformed(#[from] VerdictParseError),
}

impl OracleError {
    /// Short label used for metrics and log records.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Status(_) => "status",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Reasons an oracle response is not a well-formed verdict.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerdictParseError {
    /// The body is not valid JSON.
    #[error("body is not JSON: {0}")]
    InvalidJson(String),
    /// The body (or its `action_result`) is not a JSON object.
    #[error("response is not a JSON object")]
    NotAnObject,
    /// No `action` field was present.
    #[error("response carries no action")]
    MissingAction,
    /// The `action` value is not one the enforcer understands.
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    /// An action-specific field had the wrong type or range.
    #[error("invalid field `{field}`: {detail}")]
    InvalidField {
        /// Field name as sent by the oracle.
        field: &'static str,
        /// Human readable detail.
        detail: String,
    },
}

/// Failures while turning a verdict into a concrete response. The enforcer degrades every one of
/// them to pass-through.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// A redirect verdict carried no target.
    #[error("redirect verdict has no target")]
    MissingTarget,
    /// The redirect target is neither a rooted path nor an http(s) URL.
    #[error("unsupported redirect target `{0}`")]
    UnsupportedTarget(String),
    /// The requested status code is not a valid HTTP status.
    #[error("invalid status code {0}")]
    InvalidStatus(u16),
    /// A value cannot be carried in an HTTP header.
    #[error("value is not a valid header: {0}")]
    InvalidHeader(String),
}
