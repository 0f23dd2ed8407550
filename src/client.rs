//! HTTP client abstraction for talking to the upstream Ollama server
//!
//! The relay only ever sees the [`HttpClient`] trait, so the hyper client used in production can be
//! swapped for a recording stub in tests.
use async_trait::async_trait;
use axum::response::IntoResponse;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};

use crate::settings::RelaySettings;

pub type HyperClient = Client<hyper_tls::HttpsConnector<HttpConnector>, axum::body::Body>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

pub fn create_hyper_client(settings: &RelaySettings) -> HyperClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(settings.connect_timeout));
    let https = hyper_tls::HttpsConnector::new_with_connector(http);

    tracing::debug!(
        "HTTP client config: connect_timeout={:?}, pool_idle_timeout={:?}, max_idle_per_host={}",
        settings.connect_timeout,
        settings.pool_idle_timeout,
        settings.pool_max_idle_per_host
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(settings.pool_idle_timeout)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .pool_timer(TokioTimer::new())
        .build(https)
}
