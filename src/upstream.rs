//! Ollama wire format.
//!
//! The relay talks to two upstream endpoints:
//! - `GET /api/tags` lists the installed models.
//! - `POST /api/generate` streams a generation as NDJSON, one [`GenerateChunk`] per line, ending
//!   with a chunk whose `done` is true. A line carrying `error` aborts the generation.
use axum::body::Body;
use axum::http::{Method, Request, Uri, header};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::RelayError;
use crate::models::GenerationParams;
use crate::settings::RelaySettings;

pub const TAGS_PATH: &str = "api/tags";
pub const GENERATE_PATH: &str = "api/generate";

/// Error bodies are read up to this size; anything beyond is dropped.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize)]
pub(crate) struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_p: f64,
    /// Ollama's name for the token budget.
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GenerateChunk {
    #[serde(default)]
    pub(crate) response: Option<String>,
    #[serde(default)]
    pub(crate) done: bool,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: Option<String>,
}

impl TagsResponse {
    /// Model names in upstream order. Entries without a name are skipped.
    pub(crate) fn names(self) -> Vec<String> {
        self.models
            .into_iter()
            .filter_map(|entry| entry.name)
            .filter(|name| !name.is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub(crate) fn endpoint(settings: &RelaySettings, path: &str) -> Result<Uri, RelayError> {
    let url = settings.upstream_url.join(path).map_err(|e| {
        error!("Cannot join {} onto {}: {}", path, settings.upstream_url, e);
        RelayError::UpstreamUnreachable(format!("invalid upstream url: {e}"))
    })?;
    Uri::try_from(url.as_str()).map_err(|e| {
        error!("Invalid URI: {}", url);
        RelayError::UpstreamUnreachable(format!("invalid upstream url: {e}"))
    })
}

pub(crate) fn tags_request(settings: &RelaySettings) -> Result<Request<Body>, RelayError> {
    let uri = endpoint(settings, TAGS_PATH)?;
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::ACCEPT, "application/json")
        .body(Body::empty())
        .map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))
}

pub(crate) fn generate_request(
    settings: &RelaySettings,
    params: &GenerationParams,
) -> Result<Request<Body>, RelayError> {
    let uri = endpoint(settings, GENERATE_PATH)?;
    let payload = GenerateRequest {
        model: &params.model,
        prompt: &params.prompt,
        stream: true,
        options: GenerateOptions {
            temperature: params.temperature,
            top_p: params.top_p,
            num_predict: params.max_tokens,
        },
        keep_alive: settings.keep_alive.as_deref(),
    };
    let body = serde_json::to_vec(&payload)
        .map_err(|e| RelayError::InvalidParameter(format!("cannot encode request: {e}")))?;

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))
}

/// Parses one NDJSON line of a generate stream.
pub(crate) fn decode_chunk(line: &[u8]) -> Result<GenerateChunk, RelayError> {
    serde_json::from_slice(line).map_err(|e| {
        RelayError::MalformedUpstreamOutput(format!(
            "{e} in line {:?}",
            String::from_utf8_lossy(line)
        ))
    })
}

/// Extracts a human-readable message from a non-2xx upstream body.
pub(crate) async fn error_message(body: Body) -> String {
    let bytes = match axum::body::to_bytes(body, MAX_ERROR_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return format!("unreadable error body: {e}"),
    };
    match serde_json::from_slice::<ErrorBody>(&bytes) {
        Ok(body) => body.error,
        Err(_) => String::from_utf8_lossy(&bytes).trim().to_string(),
    }
}
