//! axum integration: runs every inbound request through a [`TriagePipeline`].

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::request::Parts,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::{
    enforcer::{EnforcementResult, SyntheticResponse},
    pipeline::TriagePipeline,
    snapshot::RequestSnapshot,
};

/// Wraps every route of `router` with triage.
pub fn protect<S>(router: Router<S>, pipeline: Arc<TriagePipeline>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(pipeline, triage_layer))
}

/// Middleware function evaluating one request.
///
/// The body is read up to the pipeline limit whatever its framing, classified, and forwarded
/// downstream byte for byte on pass-through. A body longer than the limit is classified on its
/// first `max_body_bytes` and the unread remainder is streamed on behind the buffered prefix.
pub async fn triage_layer(
    State(pipeline): State<Arc<TriagePipeline>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    if pipeline.bypass(parts.uri.path()).is_some() {
        let outcome = pipeline.evaluate(&snapshot(&parts, peer, &[])).await;
        return match outcome.enforcement {
            EnforcementResult::Passthrough => next.run(Request::from_parts(parts, body)).await,
            EnforcementResult::Respond(response) => response.into_response(),
        };
    }

    let buffered = buffer_prefix(body, pipeline.max_body_bytes()).await;
    if buffered.truncated {
        debug!(
            path = parts.uri.path(),
            inspected = buffered.inspected.len(),
            "request body exceeds the buffer limit; classifying its prefix"
        );
    }
    let outcome = pipeline.evaluate(&snapshot(&parts, peer, &buffered.inspected)).await;
    match outcome.enforcement {
        EnforcementResult::Passthrough => {
            next.run(Request::from_parts(parts, buffered.forward)).await
        }
        EnforcementResult::Respond(response) => response.into_response(),
    }
}

/// A request body split into what triage inspects and what travels downstream.
struct BufferedBody {
    /// At most `limit` bytes from the start of the body.
    inspected: Bytes,
    /// The complete body as the client sent it.
    forward: Body,
    truncated: bool,
}

/// Reads chunks until the stream ends, fails, or more than `limit` bytes have arrived.
///
/// A stream error is replayed to downstream after the bytes read before it, so the handler sees
/// the same broken body it would have seen without triage.
async fn buffer_prefix(body: Body, limit: usize) -> BufferedBody {
    let mut stream = Box::pin(body.into_data_stream());
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut read = 0_usize;
    let tail = loop {
        if read > limit {
            break Tail::Remaining;
        }
        match stream.next().await {
            Some(Ok(chunk)) => {
                read += chunk.len();
                chunks.push(chunk);
            }
            Some(Err(err)) => break Tail::Failed(err),
            None => break Tail::Done,
        }
    };

    if let Tail::Done = tail {
        let whole = Bytes::from(chunks.concat());
        return BufferedBody {
            inspected: whole.clone(),
            forward: Body::from(whole),
            truncated: false,
        };
    }

    let mut inspected = Vec::with_capacity(read.min(limit));
    for chunk in &chunks {
        let take = (limit - inspected.len()).min(chunk.len());
        inspected.extend_from_slice(&chunk[..take]);
    }
    let prefix = futures::stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
    let (forward, truncated) = match tail {
        Tail::Failed(err) => {
            warn!(error = %err, "request body stream failed while buffering");
            let failed = futures::stream::iter([Err(err)]);
            (Body::from_stream(prefix.chain(failed)), false)
        }
        Tail::Done | Tail::Remaining => (Body::from_stream(prefix.chain(stream)), true),
    };
    BufferedBody {
        inspected: Bytes::from(inspected),
        forward,
        truncated,
    }
}

enum Tail {
    Done,
    Remaining,
    Failed(axum::Error),
}

fn snapshot(parts: &Parts, peer: Option<SocketAddr>, body: &[u8]) -> RequestSnapshot {
    RequestSnapshot::capture(&parts.method, &parts.uri, &parts.headers, peer, body)
}

impl IntoResponse for SyntheticResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
