//! Relay settings.
//!
//! Settings are assembled once at start-up (see the binary's `config` module), validated, and then
//! shared read-only through the router state. Nothing in the relay reads configuration from the
//! environment after this point.
use anyhow::anyhow;
use bon::Builder;
use std::{collections::BTreeSet, time::Duration};
use url::Url;

use crate::errors::RelayError;

pub const DEFAULT_MODEL: &str = "phi3:mini";

/// Everything the relay needs to know about its single upstream.
#[derive(Debug, Clone, Builder)]
pub struct RelaySettings {
    /// Base URL of the Ollama server, e.g. `http://127.0.0.1:11434`.
    pub upstream_url: Url,
    /// Model used when a request doesn't name one.
    #[builder(into, default = DEFAULT_MODEL.to_string())]
    pub default_model: String,
    /// Models callers may ask for. Anything else is rejected before contacting the upstream.
    pub allowed_models: BTreeSet<String>,
    /// Bounds a whole upstream exchange, from connecting to the final body frame.
    #[builder(default = Duration::from_secs(120))]
    pub read_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
    /// Forwarded as Ollama's `keep_alive`: how long the upstream keeps a model loaded.
    #[builder(into)]
    pub keep_alive: Option<String>,
    #[builder(default = 4096)]
    pub max_tokens_limit: u32,
    /// Capacity of the channel between the upstream reader and the downstream body.
    #[builder(default = 16)]
    pub stream_buffer: usize,
    #[builder(default = 100)]
    pub pool_max_idle_per_host: usize,
    #[builder(default = Duration::from_secs(90))]
    pub pool_idle_timeout: Duration,
}

impl RelaySettings {
    /// Rejects configurations the relay cannot run with. Failing here is fatal at start-up.
    pub fn validate(mut self) -> Result<Self, anyhow::Error> {
        if !matches!(self.upstream_url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "Upstream URL '{}' must use http or https",
                self.upstream_url
            ));
        }
        if self.upstream_url.cannot_be_a_base() {
            return Err(anyhow!(
                "Upstream URL '{}' cannot be used as a base URL",
                self.upstream_url
            ));
        }
        // Endpoints are joined onto the base, so it must end with a slash or the last path
        // segment would be replaced.
        if !self.upstream_url.path().ends_with('/') {
            let path = format!("{}/", self.upstream_url.path());
            self.upstream_url.set_path(&path);
        }

        self.allowed_models = self
            .allowed_models
            .into_iter()
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .collect();
        if self.allowed_models.is_empty() {
            return Err(anyhow!("The model allow-list must not be empty"));
        }
        if !self.allowed_models.contains(&self.default_model) {
            return Err(anyhow!(
                "Default model '{}' is not in the allow-list {:?}",
                self.default_model,
                self.allowed_models
            ));
        }

        if self.read_timeout.is_zero() {
            return Err(anyhow!("Read timeout must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("Connect timeout must be greater than zero"));
        }
        if self.max_tokens_limit == 0 {
            return Err(anyhow!("Max tokens limit must be greater than zero"));
        }
        if self.stream_buffer == 0 {
            return Err(anyhow!("Stream buffer must hold at least one chunk"));
        }

        Ok(self)
    }

    pub fn is_allowed(&self, model: &str) -> bool {
        self.allowed_models.contains(model)
    }

    /// Fails with [`RelayError::InvalidModel`] unless the model is allow-listed.
    pub fn ensure_allowed(&self, model: &str) -> Result<(), RelayError> {
        if self.is_allowed(model) {
            Ok(())
        } else {
            Err(RelayError::InvalidModel(model.to_string()))
        }
    }
}
