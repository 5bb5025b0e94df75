//! Routing and failover engine.
//!
//! One request is tried against eligible upstreams in priority order. Each
//! attempt translates the request, dispatches through the shared HTTP
//! client, and either commits (2xx) or classifies the failure to decide
//! between failover and returning the error to the client.

use crate::models::{ClaudeMessage, ClaudeRequest};
use crate::pool::{EndpointPool, Upstream};
use crate::providers::error::{is_retryable_status, ErrorClass, ProviderError};
use crate::providers::streaming::StreamTally;
use crate::providers::{self, UpstreamRequest};
use crate::stats::StatsStore;
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Connect timeout for upstream sockets.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Hard per-attempt deadline for buffered requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Hard per-attempt deadline for streaming requests, covering the body.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// Client-facing SSE byte stream for a committed streaming request. Errors
/// never surface here; failures are folded into synthesized events.
pub type ClientStream = Pin<Box<dyn futures::Stream<Item = Result<Bytes, Infallible>> + Send>>;

/// What the engine hands back on success.
pub enum ProxyResponse {
    Message(Box<ClaudeMessage>),
    Stream(ClientStream),
}

/// One entry in the failover ledger, reported when the pool is exhausted.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttemptFailure {
    pub name: String,
    pub error: ErrorClass,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("no upstream available")]
    NoUpstreams,
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("all upstreams failed")]
    AllFailed(Vec<AttemptFailure>),
}

enum AttemptError {
    Failover(ErrorClass),
    Fatal(EngineError),
}

pub struct ProxyEngine {
    pool: Arc<EndpointPool>,
    stats: Arc<StatsStore>,
    client: reqwest::Client,
}

impl ProxyEngine {
    pub fn new(pool: Arc<EndpointPool>, stats: Arc<StatsStore>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self { pool, stats, client }
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<StatsStore> {
        &self.stats
    }

    /// Route one Claude request through the pool.
    pub async fn handle(&self, request: ClaudeRequest) -> Result<ProxyResponse, EngineError> {
        let attempts = self.pool.attempt_order();
        if attempts.is_empty() {
            return Err(EngineError::NoUpstreams);
        }

        let streaming = request.wants_stream();
        let mut failures: Vec<AttemptFailure> = Vec::new();

        for upstream in attempts {
            // Translation happens before any stats are touched: a request
            // that cannot be expressed for this target is a proxy-level 400.
            let raw = match providers::build_request(&upstream, &request) {
                Ok(raw) => raw,
                Err(ProviderError::Translation(msg)) => {
                    return Err(EngineError::BadRequest(msg));
                }
                Err(e) => return Err(EngineError::BadRequest(e.to_string())),
            };

            tracing::debug!(
                upstream = %upstream.name,
                kind = %upstream.kind,
                streaming,
                "dispatching attempt"
            );

            let outcome = if streaming {
                self.stream_attempt(&upstream, &raw, &request).await
            } else {
                self.buffered_attempt(&upstream, &raw, &request).await
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Failover(class)) => {
                    tracing::warn!(upstream = %upstream.name, error = %class, "attempt failed, trying next upstream");
                    failures.push(AttemptFailure {
                        name: upstream.name.clone(),
                        error: class,
                    });
                }
            }
        }

        Err(EngineError::AllFailed(failures))
    }

    async fn dispatch(
        &self,
        upstream: &Upstream,
        raw: &UpstreamRequest,
        streaming: bool,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("https://{}{}", upstream.host, raw.path);
        let timeout = if streaming { STREAM_TIMEOUT } else { REQUEST_TIMEOUT };

        let mut builder = self.client.post(&url).timeout(timeout);
        for (name, value) in &raw.headers {
            builder = builder.header(*name, value);
        }
        if !raw.query.is_empty() {
            builder = builder.query(&raw.query);
        }
        builder.json(&raw.body).send().await
    }

    /// Dispatch and classify up to the status line. Returns the response
    /// only when it is 2xx and the attempt is committed to this upstream.
    async fn committed_response(
        &self,
        upstream: &Upstream,
        raw: &UpstreamRequest,
        streaming: bool,
    ) -> Result<reqwest::Response, AttemptError> {
        self.stats.record_attempt(&upstream.name);

        let response = match self.dispatch(upstream, raw, streaming).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(upstream = %upstream.name, error = %e, "transport failure");
                self.stats.record_error(&upstream.name);
                self.pool.mark_failed(&upstream.name);
                return Err(AttemptError::Failover(ErrorClass::Transport));
            }
        };

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_else(|_| String::new());
        self.stats.record_error(&upstream.name);

        if is_retryable_status(status) {
            self.pool.mark_failed(&upstream.name);
            Err(AttemptError::Failover(ErrorClass::UpstreamTransient))
        } else {
            // A client error will fail the same way everywhere: surface it.
            Err(AttemptError::Fatal(EngineError::Upstream { status, message }))
        }
    }

    async fn buffered_attempt(
        &self,
        upstream: &Upstream,
        raw: &UpstreamRequest,
        request: &ClaudeRequest,
    ) -> Result<ProxyResponse, AttemptError> {
        // An unparseable 2xx body gets one retry against the same upstream
        // before this attempt is treated as transient.
        for retry in 0..2 {
            let response = self.committed_response(upstream, raw, false).await?;

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(upstream = %upstream.name, error = %e, "failed reading upstream body");
                    self.stats.record_error(&upstream.name);
                    self.pool.mark_failed(&upstream.name);
                    return Err(AttemptError::Failover(ErrorClass::Transport));
                }
            };

            match providers::parse_response(upstream.kind, &request.model, &body) {
                Ok(message) => {
                    self.stats.record_tokens(
                        &upstream.name,
                        message.usage.input_tokens,
                        message.usage.output_tokens,
                    );
                    self.pool.mark_ok(&upstream.name);
                    return Ok(ProxyResponse::Message(Box::new(message)));
                }
                Err(e) => {
                    self.stats.record_error(&upstream.name);
                    if retry == 0 {
                        tracing::warn!(upstream = %upstream.name, error = %e, "malformed upstream response, retrying once");
                        continue;
                    }
                    self.pool.mark_failed(&upstream.name);
                    return Err(AttemptError::Failover(ErrorClass::UpstreamTransient));
                }
            }
        }
        unreachable!("buffered retry loop always returns")
    }

    async fn stream_attempt(
        &self,
        upstream: &Upstream,
        raw: &UpstreamRequest,
        request: &ClaudeRequest,
    ) -> Result<ProxyResponse, AttemptError> {
        let response = self.committed_response(upstream, raw, true).await?;

        // From here the attempt is committed: bytes flow to the client and
        // a mid-stream failure completes the stream instead of failing over.
        let tally = StreamTally::shared();
        let input_hint = estimate_input_tokens(request);
        let events =
            providers::claude_event_stream(upstream.kind, &request.model, response, tally.clone());

        let name = upstream.name.clone();
        let stats = self.stats.clone();
        let pool = self.pool.clone();
        let finalized = events
            .chain(futures::stream::once(async move {
                let tally = tally.lock().unwrap();
                if tally.failed {
                    stats.record_error(&name);
                    pool.mark_failed(&name);
                } else {
                    let input = if tally.input_tokens > 0 {
                        tally.input_tokens
                    } else {
                        input_hint
                    };
                    stats.record_tokens(&name, input, tally.output_tokens());
                    pool.mark_ok(&name);
                }
                Bytes::new()
            }))
            .filter(|bytes| futures::future::ready(!bytes.is_empty()))
            .map(Ok::<Bytes, Infallible>);

        Ok(ProxyResponse::Stream(Box::pin(finalized)))
    }
}

/// Word-boundary input estimate, used for streaming telemetry when the
/// provider never reports prompt tokens. Approximate by design.
fn estimate_input_tokens(request: &ClaudeRequest) -> u64 {
    use crate::providers::streaming::estimate_tokens;

    let system = request
        .system
        .as_ref()
        .map(|s| estimate_tokens(&s.flattened_text()))
        .unwrap_or(0);
    let messages: u64 = request
        .messages
        .iter()
        .map(|m| estimate_tokens(&m.content.flattened_text()))
        .sum();
    system + messages
}
