//! Ollama relay - a minimal streaming gateway in front of a local Ollama server
//!
//! This library forwards text-generation requests to a single upstream Ollama instance and relays
//! the answer back, either materialised in one JSON payload or streamed chunk by chunk. Requests
//! are checked against a model allow-list before anything is sent upstream.

use axum::Router;
use axum::routing::get;
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, instrument};

pub mod client;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod ndjson;
pub mod relay;
pub mod settings;
pub mod upstream;

use client::{HttpClient, HyperClient};
pub use errors::RelayError;
pub use settings::RelaySettings;

/// The main application state: the HTTP client and the immutable relay settings
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub settings: Arc<RelaySettings>,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(settings: RelaySettings) -> Self {
        let http_client = client::create_hyper_client(&settings);
        Self {
            http_client,
            settings: Arc::new(settings),
        }
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(settings: RelaySettings, http_client: T) -> Self {
        Self {
            http_client,
            settings: Arc::new(settings),
        }
    }
}

/// Build the main router for the relay
/// This creates routes for:
/// - `/models` - Lists the upstream's models
/// - `/chat` - Runs a generation and returns the whole text (GET query or POST JSON)
/// - `/stream` - Runs a generation and streams the text as it is produced
/// - `/health` - Probes the upstream
/// - `/warmup` - Loads a model upstream ahead of real traffic
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/", get(handlers::root))
        .route("/models", get(handlers::models::<T>))
        .route(
            "/chat",
            get(handlers::chat_get::<T>).post(handlers::chat_post::<T>),
        )
        .route("/stream", get(handlers::stream::<T>))
        .route("/health", get(handlers::health::<T>))
        .route("/warmup", get(handlers::warmup::<T>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// The prefix is prepended to every metric name, e.g. `ollama_relay_http_requests_total`.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    type ResponseBuilder =
        dyn Fn() -> Result<axum::response::Response, std::io::Error> + Send + Sync;

    /// A stand-in for the upstream that records every request it receives.
    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        response_builder: Arc<ResponseBuilder>,
        hang: bool,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    /// Observes when an upstream body is dropped, i.e. when the relay lets go of the connection.
    #[derive(Debug, Clone, Default)]
    pub struct DropProbe(Arc<AtomicBool>);

    pub struct DropGuard(Arc<AtomicBool>);

    impl DropProbe {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn guard(&self) -> DropGuard {
            DropGuard(Arc::clone(&self.0))
        }

        pub fn is_dropped(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Drop for DropGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Ollama generate frames for the given fragments, followed by the final `done` frame.
    pub fn ndjson_lines(fragments: &[&str]) -> Vec<String> {
        fragments
            .iter()
            .map(|fragment| {
                format!(
                    "{}\n",
                    serde_json::json!({"model": "phi3:mini", "response": fragment, "done": false})
                )
            })
            .chain(std::iter::once(
                "{\"model\":\"phi3:mini\",\"response\":\"\",\"done\":true}\n".to_string(),
            ))
            .collect()
    }

    fn streaming_response(
        status: StatusCode,
        body: axum::body::Body,
    ) -> Result<axum::response::Response, std::io::Error> {
        Ok(axum::response::Response::builder()
            .status(status)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .unwrap())
    }

    impl MockHttpClient {
        fn with_builder(builder: Arc<ResponseBuilder>) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                response_builder: builder,
                hang: false,
            }
        }

        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_string();
            Self::with_builder(Arc::new(move || {
                Ok(axum::response::Response::builder()
                    .status(status)
                    .body(axum::body::Body::from(body.clone()))
                    .unwrap())
            }))
        }

        /// Serves each chunk as a separate body frame.
        pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
            Self::with_builder(Arc::new(move || {
                let stream = futures_util::stream::iter(
                    chunks
                        .clone()
                        .into_iter()
                        .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
                );
                streaming_response(status, axum::body::Body::from_stream(stream))
            }))
        }

        /// A well-behaved generate stream producing the given fragments.
        pub fn ndjson(fragments: &[&str]) -> Self {
            Self::new_streaming(StatusCode::OK, ndjson_lines(fragments))
        }

        /// Serves the chunks, then never produces another byte. The body holds a guard from
        /// `probe` so tests can see when it gets dropped.
        pub fn stalling(chunks: Vec<String>, probe: &DropProbe) -> Self {
            let probe = probe.clone();
            Self::with_builder(Arc::new(move || {
                let guard = probe.guard();
                let stream = futures_util::stream::iter(
                    chunks
                        .clone()
                        .into_iter()
                        .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
                )
                .chain(futures_util::stream::pending())
                .map(move |chunk| {
                    let _guard = &guard;
                    chunk
                });
                streaming_response(StatusCode::OK, axum::body::Body::from_stream(stream))
            }))
        }

        /// Like `new_streaming`, counting how many frames the relay has pulled.
        pub fn counting(chunks: Vec<String>, polled: Arc<AtomicUsize>) -> Self {
            Self::with_builder(Arc::new(move || {
                let polled = Arc::clone(&polled);
                let stream = futures_util::stream::iter(chunks.clone()).map(move |chunk| {
                    polled.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(chunk.into_bytes())
                });
                streaming_response(StatusCode::OK, axum::body::Body::from_stream(stream))
            }))
        }

        /// Fails every request as if nothing were listening.
        pub fn refusing() -> Self {
            Self::with_builder(Arc::new(|| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))
            }))
        }

        /// Accepts requests and never answers.
        pub fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::new(StatusCode::OK, "")
            }
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("response_builder", &"<closure>")
                .field("hang", &self.hang)
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                response_builder: Arc::clone(&self.response_builder),
                hang: self.hang,
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            // Extract request details
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            // Read body
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            // Store the request
            let mock_request = MockRequest {
                method,
                uri,
                headers,
                body,
            };
            self.requests.lock().unwrap().push(mock_request);

            if self.hang {
                std::future::pending::<()>().await;
            }

            (self.response_builder)()
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        }
    }
}
