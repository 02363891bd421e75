//! Static configuration for the reply engine.
//!
//! Generation parameters are fixed at init time and serialized into every
//! provider request; nothing here varies at runtime. The one required value
//! is the provider API key, resolved from the environment.

use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required credential: set {0}")]
    MissingCredential(&'static str),
    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Sampling bounds sent with every generation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            temperature: 0.7,
            top_p: 1.0,
            max_output_tokens: 1024,
        }
    }
}

/// Optional TOML overlay for the non-secret settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    model: Option<String>,
    base_url: Option<String>,
    generation: GenerationConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub generation: GenerationConfig,
}

impl Config {
    /// Resolve configuration from the environment alone.
    ///
    /// The API key is required; absence is fatal and not retried.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(|name| std::env::var(name).ok(), None)
    }

    /// Resolve configuration from the environment plus an optional TOML file
    /// overriding model, base URL, and generation parameters.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::resolve(|name| std::env::var(name).ok(), Some(file))
    }

    fn resolve(
        env: impl Fn(&str) -> Option<String>,
        file: Option<FileConfig>,
    ) -> Result<Self, ConfigError> {
        let api_key = env(API_KEY_ENV)
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingCredential(API_KEY_ENV))?;
        let file = file.unwrap_or_default();
        let base_url = file
            .base_url
            .or_else(|| env(BASE_URL_ENV))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = file.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Config {
            api_key,
            base_url,
            model,
            generation: file.generation,
        })
    }
}
