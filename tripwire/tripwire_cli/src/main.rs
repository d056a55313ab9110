use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use clap::{Parser, Subcommand};
use prometheus::Registry;
use serde::Deserialize;
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use tokio::{net::TcpListener, runtime::Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tripwire_triage::{
    decoy, encode_text, protect, HttpOracle, Prefilter, ProbeRequest, RequestSnapshot,
    TrafficBatch, TriageConfig, TriageMetrics, TriagePipeline, TriageTelemetry,
};

#[derive(Parser, Debug)]
#[command(name = "tripwire", version, about = "Inline traffic triage for web services")]
struct Cli {
    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the demo application behind the triage middleware.
    Serve {
        /// TOML configuration; environment variables alone when absent.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },
    /// Fires a batch of probes at a running service and prints the report.
    Probe(ProbeArgs),
    /// Runs the prefilter on one request without contacting the oracle.
    Classify {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        path: String,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        content_type: Option<String>,
    },
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    #[arg(long)]
    target: String,
    #[arg(long, default_value = "/")]
    path: String,
    /// Sent as a form-encoded POST body.
    #[arg(long)]
    payload: Option<String>,
    #[arg(long, default_value_t = 1)]
    count: usize,
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
    /// Sets `X-Forwarded-For` to impersonate a client address.
    #[arg(long)]
    source: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Serve { config, bind } => {
            let config = load_config(config)?;
            Runtime::new()?.block_on(serve(config, bind))
        }
        Commands::Probe(args) => Runtime::new()?.block_on(probe(args)),
        Commands::Classify {
            config,
            path,
            method,
            body,
            content_type,
        } => classify(load_config(config)?, &path, &method, body, content_type),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<TriageConfig> {
    match path {
        Some(path) => TriageConfig::load(&path),
        None => TriageConfig::from_env(),
    }
}

#[derive(Clone)]
struct AppState {
    registry: Registry,
    events: Option<Arc<FileEventPublisher>>,
}

async fn serve(config: TriageConfig, bind: SocketAddr) -> Result<()> {
    let registry = Registry::new();
    let metrics = TriageMetrics::new(&registry).context("registering triage metrics")?;
    let events = config
        .event_log_path
        .as_ref()
        .map(FileEventPublisher::new)
        .transpose()
        .context("opening event log")?
        .map(Arc::new);

    let mut telemetry = TriageTelemetry::builder("triage").min_level(config.log_level);
    if let Some(path) = &config.log_path {
        telemetry = telemetry.log_path(path);
    }
    if let Some(events) = &events {
        telemetry = telemetry.event_publisher(events.clone());
    }
    let oracle = HttpOracle::new(config.oracle_endpoint.clone(), config.deadline())?;
    let pipeline = TriagePipeline::from_config(&config, Arc::new(oracle))
        .telemetry(telemetry.build()?)
        .metrics(metrics)
        .build();

    let protected = Router::new()
        .route("/", get(index))
        .route("/login", get(login_form).post(login))
        .route("/health", get(health))
        .merge(decoy::routes());
    let app = protect(protected, Arc::new(pipeline)).merge(
        Router::new()
            .route("/metrics", get(metrics_text))
            .route("/events", get(recent_events))
            .with_state(AppState { registry, events }),
    );

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(
        %bind,
        oracle = %config.oracle_endpoint,
        deadline_ms = config.deadline_ms,
        enabled = config.enabled,
        "tripwire listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .context("serving")
}

async fn index() -> Html<&'static str> {
    Html("<h1>Shop</h1><p><a href=\"/login\">Sign in</a></p>")
}

async fn login_form() -> Html<&'static str> {
    Html(
        "<form method=\"post\" action=\"/login\">\
         <input name=\"username\"><input name=\"password\" type=\"password\">\
         <button>Sign in</button></form>",
    )
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
}

async fn login(Form(credentials): Form<Credentials>) -> impl IntoResponse {
    (
        StatusCode::UNAUTHORIZED,
        format!("invalid credentials for {}", credentials.username),
    )
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match encode_text(&state.registry) {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default = "default_event_limit")]
    limit: usize,
}

const fn default_event_limit() -> usize {
    50
}

async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let Some(events) = &state.events else {
        return (StatusCode::NOT_FOUND, "event log disabled").into_response();
    };
    match events.read_last(query.limit).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn probe(args: ProbeArgs) -> Result<()> {
    let batch = TrafficBatch::new(
        args.target.clone(),
        args.concurrency,
        Duration::from_millis(args.timeout_ms),
    )?;
    let mut template = match &args.payload {
        Some(payload) => ProbeRequest::post_form(args.path.clone(), payload.clone()),
        None => ProbeRequest::get(args.path.clone()),
    };
    if let Some(source) = &args.source {
        template = template.with_header("x-forwarded-for", source.clone());
    }
    let report = batch.run(vec![template; args.count.max(1)]).await;
    info!(
        target = %args.target,
        probes = report.outcomes.len(),
        answered = report.answered(),
        elapsed_ms = report.elapsed_ms,
        "probe batch finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn classify(
    config: TriageConfig,
    path: &str,
    method: &str,
    body: Option<String>,
    content_type: Option<String>,
) -> Result<()> {
    let prefilter = Prefilter::new(&config.suspicion_tokens);
    let mut builder = RequestSnapshot::builder(method, path);
    if let Some(body) = body {
        builder = builder.body(body);
    }
    if let Some(content_type) = content_type {
        builder = builder.content_type(content_type);
    }
    let snapshot = builder.build();
    let matched = prefilter.first_match(&snapshot);
    let report = json!({
        "suspect": matched.is_some(),
        "matched_token": matched,
        "method": snapshot.method(),
        "path": snapshot.path(),
        "payload": snapshot.payload(),
        "structured": snapshot.structured(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
