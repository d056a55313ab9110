use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use reqwest::{header, redirect, Client, Method};
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    pipeline::{TriageOutcome, TriagePipeline},
    snapshot::RequestSnapshot,
};

/// One HTTP probe issued against a protected service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    /// HTTP verb, upper-case.
    pub method: String,
    /// Path plus optional query, appended to the batch base URL.
    pub path: String,
    /// Optional request body.
    #[serde(default)]
    pub body: Option<String>,
    /// Extra headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ProbeRequest {
    /// GET probe.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            path: path.into(),
            body: None,
            headers: BTreeMap::new(),
        }
    }

    /// POST probe carrying a URL-encoded form body.
    #[must_use]
    pub fn post_form(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".into(),
            path: path.into(),
            body: Some(body.into()),
            headers: BTreeMap::new(),
        }
        .with_header("content-type", "application/x-www-form-urlencoded")
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// What one probe observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Position of the probe in the submitted batch.
    pub index: usize,
    /// Response status, absent when the probe failed.
    pub status: Option<u16>,
    /// `Location` header of redirect responses.
    pub location: Option<String>,
    /// Response body.
    pub body: Option<String>,
    /// Time until the full response was read.
    pub latency_ms: f64,
    /// Transport failure, if any.
    pub error: Option<String>,
}

impl ProbeOutcome {
    fn failed(index: usize, latency: Duration, error: impl Into<String>) -> Self {
        Self {
            index,
            status: None,
            location: None,
            body: None,
            latency_ms: latency.as_secs_f64() * 1_000.0,
            error: Some(error.into()),
        }
    }

    /// Latency as a duration.
    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::from_secs_f64(self.latency_ms.max(0.0) / 1_000.0)
    }
}

/// All outcomes of one batch, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// One outcome per submitted probe.
    pub outcomes: Vec<ProbeOutcome>,
    /// Wall time of the whole batch.
    pub elapsed_ms: f64,
}

impl BatchReport {
    /// Number of probes that received a response.
    #[must_use]
    pub fn answered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_some()).count()
    }

    /// Response count per status code.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<u16, usize> {
        let mut counts = BTreeMap::new();
        for status in self.outcomes.iter().filter_map(|o| o.status) {
            *counts.entry(status).or_insert(0) += 1;
        }
        counts
    }
}

/// Issues batches of probes with bounded concurrency. Redirects are reported, never followed.
#[derive(Debug, Clone)]
pub struct TrafficBatch {
    client: Client,
    base_url: String,
    semaphore: Arc<Semaphore>,
}

impl TrafficBatch {
    /// Creates a driver targeting `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        max_concurrency: usize,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(request_timeout)
            .build()
            .context("building probe http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
        })
    }

    /// Runs every probe and waits for all of them before reporting.
    pub async fn run(&self, probes: Vec<ProbeRequest>) -> BatchReport {
        let started = Instant::now();
        let total = probes.len();
        let mut set = JoinSet::new();
        for (index, probe) in probes.into_iter().enumerate() {
            let client = self.client.clone();
            let url = join_url(&self.base_url, &probe.path);
            let semaphore = Arc::clone(&self.semaphore);
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return ProbeOutcome::failed(index, Duration::ZERO, "probe limiter closed");
                };
                send_probe(&client, index, &url, probe).await
            });
        }

        let mut slots: Vec<Option<ProbeOutcome>> = vec![None; total];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    let index = outcome.index;
                    slots[index] = Some(outcome);
                }
                Err(err) => tracing::warn!(error = %err, "probe task failed"),
            }
        }
        let outcomes = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| ProbeOutcome::failed(index, Duration::ZERO, "probe task failed"))
            })
            .collect();
        BatchReport {
            outcomes,
            elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
        }
    }
}

async fn send_probe(client: &Client, index: usize, url: &str, probe: ProbeRequest) -> ProbeOutcome {
    let started = Instant::now();
    let method = match Method::from_bytes(probe.method.to_ascii_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(err) => return ProbeOutcome::failed(index, Duration::ZERO, err.to_string()),
    };
    let mut builder = client.request(method, url);
    for (name, value) in &probe.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = probe.body {
        builder = builder.body(body);
    }
    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => return ProbeOutcome::failed(index, started.elapsed(), err.to_string()),
    };
    let status = response.status().as_u16();
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let (body, error) = match response.text().await {
        Ok(text) => (Some(text), None),
        Err(err) => (None, Some(err.to_string())),
    };
    ProbeOutcome {
        index,
        status: Some(status),
        location,
        body,
        latency_ms: started.elapsed().as_secs_f64() * 1_000.0,
        error,
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        path.to_owned()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Runs `snapshots` through `pipeline` concurrently and returns every outcome in input order.
pub async fn evaluate_all(
    pipeline: &TriagePipeline,
    snapshots: &[RequestSnapshot],
) -> Vec<TriageOutcome> {
    futures::future::join_all(snapshots.iter().map(|s| pipeline.evaluate(s))).await
}
