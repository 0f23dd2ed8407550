/// Request and response bodies of the relay's own endpoints.
use serde::{Deserialize, Serialize};

use crate::errors::RelayError;
use crate::settings::RelaySettings;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// Parameters accepted by `/chat` and `/stream`, either as query parameters or as a JSON body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// A request whose parameters have been range-checked and defaulted. The model is checked against
/// the allow-list by the relay itself, right before any upstream call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn into_params(self, settings: &RelaySettings) -> Result<GenerationParams, RelayError> {
        if self.prompt.trim().is_empty() {
            return Err(RelayError::InvalidParameter(
                "prompt must not be empty".into(),
            ));
        }

        let temperature = self.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(RelayError::InvalidParameter(format!(
                "temperature must be between 0.0 and 2.0, got {temperature}"
            )));
        }

        let top_p = self.top_p.unwrap_or(DEFAULT_TOP_P);
        if !(0.0..=1.0).contains(&top_p) {
            return Err(RelayError::InvalidParameter(format!(
                "top_p must be between 0.0 and 1.0, got {top_p}"
            )));
        }

        let max_tokens = self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if max_tokens == 0 || max_tokens > settings.max_tokens_limit {
            return Err(RelayError::InvalidParameter(format!(
                "max_tokens must be between 1 and {}, got {max_tokens}",
                settings.max_tokens_limit
            )));
        }

        Ok(GenerationParams {
            model: self
                .model
                .filter(|model| !model.is_empty())
                .unwrap_or_else(|| settings.default_model.clone()),
            prompt: self.prompt,
            temperature,
            top_p,
            max_tokens,
        })
    }
}

/// The materialised answer returned by `/chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub response: String,
}

impl ChatResponse {
    pub fn new(params: GenerationParams, response: String) -> Self {
        ChatResponse {
            model: params.model,
            prompt: params.prompt,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            response,
        }
    }
}

/// The models the upstream currently serves, in upstream order, plus the raw upstream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelList {
    pub names: Vec<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub ok: bool,
    pub ollama_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarmupQuery {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarmupStatus {
    pub ok: bool,
    pub model: String,
    pub latency_ms: u64,
}
