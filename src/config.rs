//! # Configuration Management
//!
//! Loads application configuration from layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - `config.toml` in the working directory, if present
//! - Environment variables with an `APP_` prefix
//! - Flat deployment-style variables (`HOST`, `PORT`, `OPENAI_API_KEY`,
//!   `MODEL_NAME`, `LOG_LEVEL`) which override everything else
//!
//! Later sources win. The loaded config is validated once at startup and
//! then injected into the session coordinator and the provider-facing
//! components; nothing reads configuration as ambient global state.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub logging: LoggingConfig,
}

/// Bind address for the HTTP/WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Settings for the realtime transcription provider.
///
/// The long-lived `api_key` is only ever used for the one-shot credential
/// mint; the provider WebSocket itself authenticates with the ephemeral
/// credential that call returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: String,
    /// HTTP endpoint that mints ephemeral session credentials.
    pub sessions_url: String,
    /// WebSocket endpoint for the realtime transcription session.
    pub realtime_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback log level when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            provider: ProviderConfig {
                api_key: String::new(),
                model: "gpt-4o-transcribe".to_string(),
                sessions_url: "https://api.openai.com/v1/realtime/sessions".to_string(),
                realtime_url: "wss://api.openai.com/v1/realtime?intent=transcription".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Flat variable names used by deployment platforms and by the
        // service's own .env convention.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("provider.api_key", key)?;
        }
        if let Ok(model) = env::var("MODEL_NAME") {
            settings = settings.set_override("provider.model", model)?;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            settings = settings.set_override("logging.level", level)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing API key is deliberately not a validation error: the
    /// server still starts (health endpoint stays useful) and each
    /// session fails at the authorizing step instead. Startup logs a
    /// critical message for it in `main`.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.provider.model.is_empty() {
            return Err(anyhow::anyhow!("Provider model cannot be empty"));
        }

        if self.provider.sessions_url.is_empty() {
            return Err(anyhow::anyhow!("Provider sessions URL cannot be empty"));
        }

        if !self.provider.realtime_url.starts_with("ws") {
            return Err(anyhow::anyhow!(
                "Provider realtime URL must be a ws:// or wss:// URL"
            ));
        }

        Ok(())
    }
}
