//! Configuration parsing and validation for the relay server
//!
//! This module handles command-line argument parsing using clap. Every flag can also be supplied
//! through the environment (optionally from a `.env` file). The parsed flags are turned into the
//! immutable [`RelaySettings`] the library runs on.
use clap::{ArgAction, Parser};
use ollama_relay::RelaySettings;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The address on which the relay will listen.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// The port on which the relay will listen.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Base URL of the upstream Ollama server.
    #[arg(long, env = "OLLAMA_URL", default_value = "http://127.0.0.1:11434")]
    pub ollama_url: Url,

    /// Model used when a request doesn't name one. Must be in the allow-list.
    #[arg(long, env = "DEFAULT_MODEL", default_value = "phi3:mini")]
    pub default_model: String,

    /// Comma-separated list of models callers may use.
    #[arg(
        long,
        env = "ALLOWED_MODELS",
        value_delimiter = ',',
        default_value = "phi3:mini"
    )]
    pub allowed_models: Vec<String>,

    /// Upper bound (in seconds) on a whole upstream exchange.
    #[arg(long, env = "READ_TIMEOUT_SECS", default_value_t = 120)]
    pub read_timeout_secs: u64,

    /// How long (in seconds) to wait for the upstream TCP connection.
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// How long the upstream should keep a model loaded after a request, in Ollama's duration
    /// syntax (e.g. "5m", "1h", "-1").
    #[arg(long, env = "OLLAMA_KEEP_ALIVE")]
    pub keep_alive: Option<String>,

    /// Largest `max_tokens` a caller may request.
    #[arg(long, env = "MAX_TOKENS_LIMIT", default_value_t = 4096)]
    pub max_tokens_limit: u32,

    /// Number of chunks buffered between the upstream and a slow streaming caller.
    #[arg(long, env = "STREAM_BUFFER", default_value_t = 16)]
    pub stream_buffer: usize,

    /// Maximum number of idle HTTP connections to keep alive to the upstream.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, env = "METRICS", default_value_t = true, action = ArgAction::Set)]
    pub metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "ollama_relay")]
    pub metrics_prefix: String,
}

impl Config {
    /// Builds and validates the relay settings. Any error here should stop the process.
    pub fn settings(&self) -> Result<RelaySettings, anyhow::Error> {
        RelaySettings::builder()
            .upstream_url(self.ollama_url.clone())
            .default_model(self.default_model.clone())
            .allowed_models(self.allowed_models.iter().cloned().collect())
            .read_timeout(Duration::from_secs(self.read_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .maybe_keep_alive(self.keep_alive.clone().filter(|k| !k.is_empty()))
            .max_tokens_limit(self.max_tokens_limit)
            .stream_buffer(self.stream_buffer)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(self.pool_idle_timeout_secs))
            .build()
            .validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["ollama-relay"]).unwrap();
        let settings = config.settings().unwrap();

        assert!(config.metrics);
        assert_eq!(settings.upstream_url.as_str(), "http://127.0.0.1:11434/");
        assert_eq!(settings.default_model, "phi3:mini");
        assert!(settings.is_allowed("phi3:mini"));
        assert_eq!(settings.read_timeout, Duration::from_secs(120));
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_allowed_models_are_comma_separated() {
        let config = Config::try_parse_from([
            "ollama-relay",
            "--allowed-models",
            "phi3:mini, llama3.1:latest",
            "--keep-alive",
            "10m",
            "--metrics",
            "false",
        ])
        .unwrap();
        let settings = config.settings().unwrap();

        assert!(!config.metrics);
        assert_eq!(settings.allowed_models.len(), 2);
        assert!(settings.is_allowed("llama3.1:latest"));
        assert_eq!(settings.keep_alive.as_deref(), Some("10m"));
    }

    #[test]
    fn test_default_model_outside_allow_list_is_fatal() {
        let config = Config::try_parse_from([
            "ollama-relay",
            "--allowed-models",
            "llama3.1:latest",
        ])
        .unwrap();

        assert!(config.settings().is_err());
    }

    #[test]
    fn test_invalid_url_is_rejected_by_the_parser() {
        let result = Config::try_parse_from(["ollama-relay", "--ollama-url", "not a url"]);
        assert!(result.is_err());
    }
}
