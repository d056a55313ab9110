#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Inline request triage: local prefilter, deadline-bounded oracle consultation and fail-open
//! enforcement of redirect, fake-data and tarpit verdicts, packaged as axum middleware.

/// Error types for oracle calls, verdict parsing and enforcement.
#[path = "../error.rs"]
pub mod error;

/// File and environment configuration.
#[path = "../config.rs"]
pub mod config;

/// Request projection handed to every stage.
#[path = "../snapshot.rs"]
pub mod snapshot;

/// Token-based suspicion gate.
#[path = "../prefilter.rs"]
pub mod prefilter;

/// Verdict contract and decision types.
#[path = "../decision.rs"]
pub mod decision;

/// Oracle transport and bounded-time client.
#[path = "../oracle.rs"]
pub mod oracle;

/// Verdict enforcement.
#[path = "../enforcer.rs"]
pub mod enforcer;

/// Decoy routes.
#[path = "../decoy.rs"]
pub mod decoy;

/// Outcome log and event publishing.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Prometheus collectors.
#[path = "../metrics.rs"]
pub mod metrics;

/// Per-request orchestration.
#[path = "../pipeline.rs"]
pub mod pipeline;

/// axum middleware.
#[path = "../middleware.rs"]
pub mod middleware;

/// Batch probing and in-process batch evaluation.
#[path = "../batch.rs"]
pub mod batch;

pub use batch::{evaluate_all, BatchReport, ProbeOutcome, ProbeRequest, TrafficBatch};
pub use config::TriageConfig;
pub use decision::{Action, Decision, Diagnostics, NoVerdictCause, Verdict, VerdictRequest};
pub use enforcer::{EnforcementResult, Enforcer, SyntheticResponse};
pub use error::{OracleError, ResolutionError, VerdictParseError};
pub use metrics::{encode_text, MetricsError, TriageMetrics};
pub use middleware::{protect, triage_layer};
pub use oracle::{Consultation, DecisionClient, DecisionOracle, HttpOracle};
pub use pipeline::{Route, TriageOutcome, TriagePipeline, TriagePipelineBuilder};
pub use prefilter::Prefilter;
pub use snapshot::{RequestSnapshot, SnapshotBuilder};
pub use telemetry::{TriageTelemetry, TriageTelemetryBuilder};
