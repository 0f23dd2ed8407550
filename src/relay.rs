//! The streaming relay.
//!
//! Every relay operation opens exactly one upstream request and bounds the whole exchange by the
//! configured read timeout. A generation is either collected into one string ([`complete`]) or
//! forwarded chunk by chunk ([`stream`]). In the streaming case a producer task reads upstream
//! frames and pushes text into a bounded channel that the downstream body drains, so upstream
//! reads are paced by downstream writes. The producer drops the upstream body on every exit path,
//! which closes the upstream connection.
use axum::body::{BodyDataStream, Bytes};
use axum::http::StatusCode;
use axum::response::Response;
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::client::HttpClient;
use crate::errors::RelayError;
use crate::models::{GenerationParams, HealthStatus, ModelList};
use crate::ndjson::{NdjsonBufferedStream, NdjsonError};
use crate::settings::RelaySettings;
use crate::upstream::{self, TagsResponse};

/// Prompt sent by [`warm_up`]; only its side effect of loading the model matters.
pub const WARMUP_PROMPT: &str = "hi";

/// `/api/tags` bodies larger than this are treated as malformed.
const MAX_TAGS_BODY_BYTES: usize = 16 * 1024 * 1024;

/// An open upstream generation. Dropping it closes the upstream connection.
pub struct Generation {
    frames: NdjsonBufferedStream<BodyDataStream>,
    status: StatusCode,
    deadline: Instant,
    done: bool,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("status", &self.status)
            .field("deadline", &self.deadline)
            .field("done", &self.done)
            .finish()
    }
}

impl Generation {
    fn new(response: Response, deadline: Instant) -> Self {
        let status = response.status();
        Self {
            frames: NdjsonBufferedStream::new(response.into_body().into_data_stream()),
            status,
            deadline,
            done: false,
        }
    }

    /// The next non-empty text fragment, or `None` once the upstream reports `done` or closes the
    /// body.
    pub async fn next_text(&mut self) -> Result<Option<String>, RelayError> {
        loop {
            if self.done {
                return Ok(None);
            }

            let line = match timeout_at(self.deadline, self.frames.next()).await {
                Err(_) => return Err(RelayError::UpstreamTimeout),
                Ok(None) => {
                    debug!("Upstream body ended without a done frame");
                    self.done = true;
                    return Ok(None);
                }
                Ok(Some(Err(NdjsonError::Body(e)))) => {
                    return Err(RelayError::UpstreamUnreachable(format!(
                        "upstream body interrupted: {e}"
                    )));
                }
                Ok(Some(Err(e @ NdjsonError::LineTooLong { .. }))) => {
                    warn!("Upstream frame rejected: {}", e);
                    return Err(RelayError::MalformedUpstreamOutput(e.to_string()));
                }
                Ok(Some(Ok(line))) => line,
            };

            let chunk = upstream::decode_chunk(&line)?;
            if let Some(message) = chunk.error {
                return Err(RelayError::UpstreamError {
                    status: self.status,
                    message,
                });
            }
            if chunk.done {
                self.done = true;
            }
            match chunk.response {
                Some(text) if !text.is_empty() => return Ok(Some(text)),
                _ => continue,
            }
        }
    }

    /// Reads the generation to the end and concatenates every fragment.
    pub async fn collect(mut self) -> Result<String, RelayError> {
        let mut output = String::new();
        while let Some(text) = self.next_text().await? {
            output.push_str(&text);
        }
        Ok(output)
    }
}

/// Sends one request upstream and maps transport failures and non-2xx statuses onto
/// [`RelayError`]s.
async fn send<T: HttpClient>(
    client: &T,
    request: axum::extract::Request,
    deadline: Instant,
) -> Result<Response, RelayError> {
    let uri = request.uri().clone();

    let response = match timeout_at(deadline, client.request(request)).await {
        Err(_) => {
            warn!("Timed out waiting for upstream {}", uri);
            return Err(RelayError::UpstreamTimeout);
        }
        Ok(Err(e)) => {
            error!("Error forwarding request to upstream {}: {}", uri, e);
            return Err(RelayError::UpstreamUnreachable(e.to_string()));
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if !status.is_success() {
        let message = timeout_at(deadline, upstream::error_message(response.into_body()))
            .await
            .unwrap_or_else(|_| "timed out reading error body".to_string());
        warn!("Upstream {} returned {}: {}", uri, status, message);
        return Err(RelayError::UpstreamError { status, message });
    }

    Ok(response)
}

/// Checks the model against the allow-list and opens a generation. Nothing is sent upstream for a
/// disallowed model.
#[instrument(skip(client, settings, params), fields(model = %params.model))]
pub async fn open_generation<T: HttpClient>(
    client: &T,
    settings: &RelaySettings,
    params: &GenerationParams,
    deadline: Instant,
) -> Result<Generation, RelayError> {
    settings.ensure_allowed(&params.model)?;

    let request = upstream::generate_request(settings, params)?;
    let response = send(client, request, deadline).await?;
    debug!("Upstream accepted generation with {}", response.status());
    Ok(Generation::new(response, deadline))
}

/// Runs a generation to completion and returns the full text.
pub async fn complete<T: HttpClient>(
    client: &T,
    settings: &RelaySettings,
    params: &GenerationParams,
) -> Result<String, RelayError> {
    let deadline = Instant::now() + settings.read_timeout;
    let generation = open_generation(client, settings, params, deadline).await?;
    let text = generation.collect().await?;
    info!(model = %params.model, chars = text.len(), "Generation complete");
    Ok(text)
}

/// Opens a generation and returns a stream of its text fragments, in upstream order.
///
/// Errors up to and including the upstream status line are returned directly so the caller can
/// still choose a status code. Errors after that point are written into the stream as a final
/// `[relay error: <reason>]` line, after which the stream ends.
pub async fn stream<T: HttpClient>(
    client: &T,
    settings: &RelaySettings,
    params: &GenerationParams,
) -> Result<impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static, RelayError> {
    let deadline = Instant::now() + settings.read_timeout;
    let generation = open_generation(client, settings, params, deadline).await?;

    let (tx, rx) = mpsc::channel(settings.stream_buffer);
    let span = info_span!("relay_stream", model = %params.model);
    tokio::spawn(pump(generation, tx).instrument(span));

    Ok(ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>))
}

/// Moves fragments from the upstream generation into the channel until the generation ends, fails,
/// times out, or the receiving side goes away.
async fn pump(mut generation: Generation, tx: mpsc::Sender<Bytes>) {
    let deadline = generation.deadline;
    let mut forwarded = 0usize;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                info!(forwarded, "Downstream disconnected, cancelling upstream generation");
                return;
            }
            next = generation.next_text() => next,
        };

        match next {
            Ok(Some(text)) => {
                match timeout_at(deadline, tx.send(Bytes::from(text))).await {
                    Ok(Ok(())) => forwarded += 1,
                    Ok(Err(_)) => {
                        info!(forwarded, "Downstream disconnected, cancelling upstream generation");
                        return;
                    }
                    Err(_) => {
                        warn!(forwarded, "Downstream too slow, stream exceeded read timeout");
                        return;
                    }
                }
            }
            Ok(None) => {
                debug!(forwarded, "Stream complete");
                return;
            }
            Err(e) => {
                warn!(forwarded, "Stream aborted: {}", e);
                let marker = Bytes::from(format!("\n[relay error: {}]", e.reason()));
                let _ = timeout_at(deadline, tx.send(marker)).await;
                return;
            }
        }
    }
}

/// Lists the upstream's models in upstream order.
#[instrument(skip(client, settings))]
pub async fn list_models<T: HttpClient>(
    client: &T,
    settings: &RelaySettings,
) -> Result<ModelList, RelayError> {
    let deadline = Instant::now() + settings.read_timeout;
    let request = upstream::tags_request(settings)?;
    let response = send(client, request, deadline).await?;

    let bytes = timeout_at(
        deadline,
        axum::body::to_bytes(response.into_body(), MAX_TAGS_BODY_BYTES),
    )
    .await
    .map_err(|_| RelayError::UpstreamTimeout)?
    .map_err(|e| RelayError::MalformedUpstreamOutput(format!("unreadable model list: {e}")))?;

    let raw: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::MalformedUpstreamOutput(format!("model list: {e}")))?;
    let tags: TagsResponse = serde_json::from_value(raw.clone())
        .map_err(|e| RelayError::MalformedUpstreamOutput(format!("model list: {e}")))?;

    let names = tags.names();
    debug!("Upstream reports {} models", names.len());
    Ok(ModelList { names, raw })
}

/// Probes the upstream by listing its models. Never fails: unreachability is part of the status.
#[instrument(skip(client, settings))]
pub async fn probe_health<T: HttpClient>(client: &T, settings: &RelaySettings) -> HealthStatus {
    let started = Instant::now();
    let result = list_models(client, settings).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    let ollama_url = settings.upstream_url.as_str().trim_end_matches('/').to_string();

    match result {
        Ok(models) => HealthStatus {
            ok: true,
            ollama_url,
            models: Some(models.names),
            error: None,
            reason: None,
            latency_ms,
        },
        Err(e) => {
            warn!("Upstream health probe failed: {}", e);
            HealthStatus {
                ok: false,
                ollama_url,
                models: None,
                error: Some(e.to_string()),
                reason: Some(e.reason().to_string()),
                latency_ms,
            }
        }
    }
}

/// Asks the upstream to load `model` by running a one-token generation and discarding the text.
#[instrument(skip(client, settings))]
pub async fn warm_up<T: HttpClient>(
    client: &T,
    settings: &RelaySettings,
    model: &str,
) -> Result<(), RelayError> {
    let params = GenerationParams {
        model: model.to_string(),
        prompt: WARMUP_PROMPT.to_string(),
        temperature: crate::models::DEFAULT_TEMPERATURE,
        top_p: crate::models::DEFAULT_TOP_P,
        max_tokens: 1,
    };
    let _ = complete(client, settings, &params).await?;
    info!("Model {} warmed up", model);
    Ok(())
}
