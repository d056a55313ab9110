use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared_event_bus::FileEventPublisher;
use tempfile::tempdir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tripwire_triage::{
    decoy, protect, HttpOracle, ProbeRequest, TrafficBatch, TriageConfig, TriagePipeline,
    TriageTelemetry,
};

#[derive(Clone)]
struct OracleScript {
    status: StatusCode,
    body: String,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl OracleScript {
    fn replying(body: Value) -> Self {
        Self::raw(StatusCode::OK, body.to_string())
    }

    fn raw(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn oracle_handler(
    State(script): State<OracleScript>,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    script.calls.fetch_add(1, Ordering::SeqCst);
    script.seen.lock().unwrap().push(request);
    tokio::time::sleep(script.delay).await;
    (
        script.status,
        [(header::CONTENT_TYPE, "application/json")],
        script.body.clone(),
    )
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn spawn_oracle(script: &OracleScript) -> String {
    let router = Router::new()
        .route("/simulate_traffic", post(oracle_handler))
        .with_state(script.clone());
    let addr = serve(router).await;
    format!("http://{addr}/simulate_traffic")
}

fn config(endpoint: String, deadline_ms: u64) -> TriageConfig {
    TriageConfig {
        oracle_endpoint: endpoint,
        deadline_ms,
        redirect_base_url: "http://h:5000/".into(),
        ..TriageConfig::default()
    }
}

fn pipeline(config: &TriageConfig) -> TriagePipeline {
    let oracle = HttpOracle::new(config.oracle_endpoint.clone(), config.deadline()).unwrap();
    TriagePipeline::from_config(config, Arc::new(oracle)).build()
}

async fn spawn_app(pipeline: TriagePipeline) -> String {
    let routes = Router::new()
        .route("/", get(|| async { "home" }))
        .route("/echo", post(|body: String| async move { body }))
        .merge(decoy::routes());
    let addr = serve(protect(routes, Arc::new(pipeline))).await;
    format!("http://{addr}")
}

/// Sends a raw `Transfer-Encoding: chunked` POST and returns the whole HTTP response text.
async fn post_chunked(app: &str, path: &str, chunks: &[&str]) -> String {
    let authority = app.trim_start_matches("http://");
    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: {authority}\r\nContent-Type: text/plain\r\n\
         Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
    );
    for chunk in chunks {
        request.push_str(&format!("{:x}\r\n{chunk}\r\n", chunk.len()));
    }
    request.push_str("0\r\n\r\n");

    let mut stream = TcpStream::connect(authority).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn benign_requests_never_reach_the_oracle() {
    let script = OracleScript::replying(json!({ "action": "redirect", "url": "/honeypot" }));
    let endpoint = spawn_oracle(&script).await;
    let app = spawn_app(pipeline(&config(endpoint, 500))).await;

    let home = client().get(format!("{app}/?page=2")).send().await.unwrap();
    assert_eq!(home.status(), 200);
    assert_eq!(home.text().await.unwrap(), "home");

    let echo = client()
        .post(format!("{app}/echo"))
        .body("hello there")
        .send()
        .await
        .unwrap();
    assert_eq!(echo.text().await.unwrap(), "hello there");
    assert_eq!(script.calls(), 0);
}

#[tokio::test]
async fn slow_oracle_passes_through_within_the_deadline() {
    let script = OracleScript::replying(json!({ "action": "redirect", "url": "/honeypot" }))
        .after(Duration::from_secs(3));
    let endpoint = spawn_oracle(&script).await;
    let app = spawn_app(pipeline(&config(endpoint, 200))).await;

    let started = Instant::now();
    let response = client()
        .get(format!("{app}/?q=1 union select"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "home");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn redirect_verdicts_point_at_the_decoy_and_are_recorded() {
    let script = OracleScript::replying(json!({
        "decision": { "reason": "rule_match_sqli", "confidence": 0.97 },
        "action_result": { "action": "redirect_honeypot", "url": "/honeypot/fakedb" }
    }));
    let endpoint = spawn_oracle(&script).await;
    let dir = tempdir().unwrap();
    let events = Arc::new(FileEventPublisher::new(dir.path().join("events.jsonl")).unwrap());
    let telemetry = TriageTelemetry::builder("triage")
        .log_path(dir.path().join("triage.log"))
        .event_publisher(events.clone())
        .build()
        .unwrap();
    let config = config(endpoint.clone(), 500);
    let oracle = HttpOracle::new(endpoint, config.deadline()).unwrap();
    let pipeline = TriagePipeline::from_config(&config, Arc::new(oracle))
        .telemetry(telemetry)
        .build();
    let app = spawn_app(pipeline).await;

    let response = client()
        .get(format!("{app}/products?id=1 OR 1=1 UNION SELECT"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 302);
    assert_eq!(
        response.headers()[reqwest::header::LOCATION],
        "http://h:5000/honeypot/fakedb"
    );

    let seen = script.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["src_ip"], "127.0.0.1");
    assert!(seen[0]["payload"].as_str().unwrap().starts_with("/products?id=1"));

    let mut recorded = Vec::new();
    for _ in 0..50 {
        recorded = events.read_last(10).await.unwrap();
        if !recorded.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].event_type, "triage.decision");
    assert_eq!(recorded[0].payload["route"], "enforced");
    assert_eq!(recorded[0].payload["diagnostics"]["reason"], "rule_match_sqli");

    let log = std::fs::read_to_string(dir.path().join("triage.log")).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("triage.outcome"));
}

#[tokio::test]
async fn fake_data_bodies_are_served_exactly() {
    let script = OracleScript::replying(json!({
        "action": "fake_data",
        "fake_payload": "{\"foo\":1}",
        "status": 200
    }));
    let endpoint = spawn_oracle(&script).await;
    let app = spawn_app(pipeline(&config(endpoint, 500))).await;

    let response = client()
        .post(format!("{app}/echo"))
        .header("content-type", "application/json")
        .body(r#"{"query": "select * from users"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "application/json"
    );
    assert_eq!(response.text().await.unwrap(), r#"{"foo":1}"#);
}

#[tokio::test]
async fn tarpits_hold_only_the_suspect_request() {
    let script = OracleScript::replying(json!({ "action": "tarpit", "delay_ms": 500 }));
    let endpoint = spawn_oracle(&script).await;
    let app = spawn_app(pipeline(&config(endpoint, 500))).await;

    let batch = TrafficBatch::new(app, 4, Duration::from_secs(5)).unwrap();
    let report = batch
        .run(vec![
            ProbeRequest::get("/?q=drop table users"),
            ProbeRequest::get("/"),
            ProbeRequest::get("/?page=3"),
            ProbeRequest::get("/"),
        ])
        .await;
    assert_eq!(report.outcomes.len(), 4);
    let tarpitted = &report.outcomes[0];
    assert_eq!(tarpitted.status, Some(200));
    assert_eq!(tarpitted.body.as_deref(), Some("Please slow down."));
    assert!(tarpitted.latency() >= Duration::from_millis(500));
    for benign in &report.outcomes[1..] {
        assert_eq!(benign.body.as_deref(), Some("home"));
        assert!(benign.latency() < Duration::from_millis(400), "{benign:?}");
    }
}

#[tokio::test]
async fn malformed_verdicts_pass_through() {
    let replies = [
        OracleScript::replying(json!({ "verdict": "block" })),
        OracleScript::replying(json!({ "action": "block" })),
        OracleScript::replying(json!({ "action": "tarpit", "status": 42 })),
        OracleScript::raw(StatusCode::OK, "not json"),
        OracleScript::raw(StatusCode::INTERNAL_SERVER_ERROR, "{}"),
    ];
    for script in replies {
        let endpoint = spawn_oracle(&script).await;
        let app = spawn_app(pipeline(&config(endpoint, 500))).await;
        let response = client()
            .get(format!("{app}/?name=<script>alert(1)</script>&sort=union"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "{}", script.body);
        assert_eq!(response.text().await.unwrap(), "home");
        assert_eq!(script.calls(), 1);
    }
}

#[tokio::test]
async fn suspect_bodies_reach_downstream_intact() {
    let body = "name=x'; DROP TABLE users; --&note=caf%C3%A9";

    let script = OracleScript::replying(json!({ "action": "allow" }));
    let endpoint = spawn_oracle(&script).await;
    let app = spawn_app(pipeline(&config(endpoint, 500))).await;
    let response = client()
        .post(format!("{app}/echo"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), body);
    assert_eq!(script.calls(), 1);
    assert_eq!(script.seen.lock().unwrap()[0]["payload"], body);

    let unreachable = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let app = spawn_app(pipeline(&config(
        format!("http://{unreachable}/simulate_traffic"),
        500,
    )))
    .await;
    let response = client()
        .post(format!("{app}/echo"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), body);
}

#[tokio::test]
async fn skipped_paths_and_decoys_are_served_directly() {
    let script = OracleScript::replying(json!({ "action": "redirect", "url": "/honeypot" }));
    let endpoint = spawn_oracle(&script).await;
    let mut config = config(endpoint, 500);
    config.skip_prefixes = vec!["/honeypot".into()];
    let app = spawn_app(pipeline(&config)).await;

    let response = client()
        .get(format!("{app}/honeypot/fakedb?q=select"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let rows: Value = response.json().await.unwrap();
    assert_eq!(rows["rows"].as_array().map(Vec::len), Some(3));
    assert_eq!(script.calls(), 0);
}

#[tokio::test]
async fn chunked_bodies_are_classified() {
    let script = OracleScript::replying(json!({
        "action": "fake_data",
        "fake_payload": "FAKE",
        "status": 200
    }));
    let endpoint = spawn_oracle(&script).await;
    let app = spawn_app(pipeline(&config(endpoint, 500))).await;

    let response = post_chunked(&app, "/echo", &["x'; DROP ", "TABLE users; --"]).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("FAKE"), "{response}");
    assert_eq!(script.calls(), 1);
    assert_eq!(
        script.seen.lock().unwrap()[0]["payload"],
        "x'; DROP TABLE users; --"
    );
}

#[tokio::test]
async fn oversized_chunked_bodies_are_classified_on_their_prefix() {
    let script = OracleScript::replying(json!({ "action": "allow" }));
    let endpoint = spawn_oracle(&script).await;
    let mut config = config(endpoint, 500);
    config.max_body_bytes = 16;
    let app = spawn_app(pipeline(&config)).await;

    let chunks = ["note=drop ", "table users; ", "and a long tail of text"];
    let response = post_chunked(&app, "/echo", &chunks).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with(&chunks.concat()), "{response}");
    assert_eq!(script.calls(), 1);
    assert_eq!(script.seen.lock().unwrap()[0]["payload"], "note=drop table ");
}
