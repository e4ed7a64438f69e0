//! Application Configuration Module
//!
//! Loads the service settings from environment variables (and a `.env` file,
//! if present) into a single struct that is built once at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use fallacy_core::classifier::{DEFAULT_ENDPOINT, DEFAULT_TIMEOUT};
use secrecy::SecretString;
use tracing::Level;

/// Capacity of the channel feeding events into the turn pipeline.
pub const PIPELINE_BUFFER: usize = 256;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: Option<SecretString>,
    pub chat_model: String,
    pub classifier_url: String,
    pub classifier_timeout: Duration,
    pub transcript_dir: PathBuf,
    pub device_bridge_url: Option<String>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// *   `BIND_ADDRESS`: Address for the HTTP server. Defaults to "0.0.0.0:3000".
    /// *   `OPENAI_API_KEY`: Key for the classifier. Without it every utterance is passed through the offline classifier.
    /// *   `CHAT_MODEL`: (Optional) The model used for classification. Defaults to "gpt-4o".
    /// *   `CLASSIFIER_URL`: (Optional) Chat-completions endpoint. Defaults to OpenAI's.
    /// *   `CLASSIFIER_TIMEOUT_SECS`: (Optional) Per-request timeout. Defaults to 10.
    /// *   `TRANSCRIPT_DIR`: (Optional) Where saved transcripts go. Defaults to "transcripts".
    /// *   `DEVICE_BRIDGE_URL`: (Optional) Base URL of the device bridge. Without it effects are only logged.
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // Empty values count as unset.
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_address_str = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let openai_api_key = var("OPENAI_API_KEY").map(SecretString::from);
        let chat_model = var("CHAT_MODEL").unwrap_or_else(|| "gpt-4o".to_string());
        let classifier_url = var("CLASSIFIER_URL").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let classifier_timeout = match var("CLASSIFIER_TIMEOUT_SECS") {
            Some(secs) => secs
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    ConfigError::InvalidValue(
                        "CLASSIFIER_TIMEOUT_SECS".to_string(),
                        format!("'{secs}' is not a positive number of seconds"),
                    )
                })?,
            None => DEFAULT_TIMEOUT,
        };

        let transcript_dir = var("TRANSCRIPT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("transcripts"));
        let device_bridge_url = var("DEVICE_BRIDGE_URL").map(|url| url.trim_end_matches('/').to_string());

        // Configure logging level from RUST_LOG, with a sensible default.
        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            bind_address,
            openai_api_key,
            chat_model,
            classifier_url,
            classifier_timeout,
            transcript_dir,
            device_bridge_url,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:3000".parse().unwrap());
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.chat_model, "gpt-4o");
        assert_eq!(config.classifier_url, DEFAULT_ENDPOINT);
        assert_eq!(config.classifier_timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.transcript_dir, PathBuf::from("transcripts"));
        assert!(config.device_bridge_url.is_none());
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("BIND_ADDRESS", "127.0.0.1:8080"),
            ("OPENAI_API_KEY", "sk-test"),
            ("CLASSIFIER_TIMEOUT_SECS", "3"),
            ("DEVICE_BRIDGE_URL", "http://glasses.local:9000/"),
            ("RUST_LOG", "debug"),
            ("TRANSCRIPT_DIR", "/var/lib/fallacy"),
        ]))
        .unwrap();

        assert_eq!(config.bind_address.port(), 8080);
        assert_eq!(
            config.openai_api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("sk-test".to_string())
        );
        assert_eq!(config.classifier_timeout, Duration::from_secs(3));
        assert_eq!(
            config.device_bridge_url.as_deref(),
            Some("http://glasses.local:9000")
        );
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.transcript_dir, PathBuf::from("/var/lib/fallacy"));
    }

    #[test]
    fn test_blank_key_counts_as_missing() {
        let config = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "  ")])).unwrap();
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("BIND_ADDRESS", "nowhere")])),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("CLASSIFIER_TIMEOUT_SECS", "0")])),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("RUST_LOG", "chatty")])),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }
}
