/// Axum handlers for the relay endpoints
use crate::AppState;
use crate::client::HttpClient;
use crate::errors::RelayError;
use crate::models::{ChatRequest, ChatResponse, ModelList, WarmupQuery, WarmupStatus};
use crate::relay;
use axum::{
    Json,
    body::Body,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

#[instrument]
pub async fn root() -> impl IntoResponse {
    Json(json!({"message": "Ollama relay is running"}))
}

#[instrument(skip(state))]
pub async fn models<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
) -> Result<Json<ModelList>, RelayError> {
    let models = relay::list_models(&state.http_client, &state.settings).await?;
    Ok(Json(models))
}

#[instrument(skip(state, query))]
pub async fn chat_get<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    query: Result<Query<ChatRequest>, QueryRejection>,
) -> Result<Json<ChatResponse>, RelayError> {
    let Query(request) = query?;
    chat(state, request).await
}

#[instrument(skip(state, body))]
pub async fn chat_post<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, RelayError> {
    let Json(request) = body?;
    chat(state, request).await
}

async fn chat<T: HttpClient + Clone + Send + Sync + 'static>(
    state: AppState<T>,
    request: ChatRequest,
) -> Result<Json<ChatResponse>, RelayError> {
    let params = request.into_params(&state.settings)?;
    info!("Received chat request for model: {}", params.model);

    let text = relay::complete(&state.http_client, &state.settings, &params).await?;
    Ok(Json(ChatResponse::new(params, text)))
}

/// Streams the generation back as plain text. The status is only committed once the upstream has
/// accepted the request.
#[instrument(skip(state, query))]
pub async fn stream<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    query: Result<Query<ChatRequest>, QueryRejection>,
) -> Result<Response, RelayError> {
    let Query(request) = query?;
    let params = request.into_params(&state.settings)?;
    info!("Received stream request for model: {}", params.model);

    let fragments = relay::stream(&state.http_client, &state.settings, &params).await?;
    debug!("Upstream accepted, streaming to caller");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(fragments),
    )
        .into_response())
}

#[instrument(skip(state))]
pub async fn health<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
) -> Response {
    let status = relay::probe_health(&state.http_client, &state.settings).await;
    let code = if status.ok {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (code, Json(status)).into_response()
}

#[instrument(skip(state, query))]
pub async fn warmup<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    query: Result<Query<WarmupQuery>, QueryRejection>,
) -> Result<Json<WarmupStatus>, RelayError> {
    let Query(query) = query?;
    let model = query
        .model
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| state.settings.default_model.clone());

    let started = Instant::now();
    relay::warm_up(&state.http_client, &state.settings, &model).await?;

    Ok(Json(WarmupStatus {
        ok: true,
        model,
        latency_ms: started.elapsed().as_millis() as u64,
    }))
}
