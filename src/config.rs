//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables with the APP_ prefix (`__` separates nesting)
//! - Conventional deployment variables (PORT, WHISPER_MODEL, API_KEY, ...)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs are serialized into the defaults layer and deserialized back out
//! - **Option<T>**: settings that may be absent (forced language, shared secret, priming text)
//! - **Closures as parameters**: the environment lookup is injected so tests never touch process env
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Conventional variables (`PORT=3000`, `WHISPER_MODEL=small`, ...)
//! 2. Prefixed variables (`APP_ENGINE__BEAM_SIZE=3`, `APP_LIMITS__MAX_UPLOAD_BYTES=1048576`)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The configuration is read once at startup and never changes afterwards.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::audio::vad::VadParameters;
use crate::pipeline::validator::AuthPolicy;
use crate::transcription::model;
use crate::transcription::DecodeOptions;

/// Compute precisions the candle backend can run here.
const SUPPORTED_COMPUTE_TYPES: &[&str] = &["f32", "float32"];

/// Conventional environment variables and the setting each one overrides.
const CONVENTIONAL_ENV: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("WHISPER_MODEL", "engine.model"),
    ("WHISPER_DEVICE", "engine.device"),
    ("WHISPER_COMPUTE_TYPE", "engine.compute_type"),
    ("WHISPER_WORKERS", "engine.workers"),
    ("WHISPER_LANGUAGE", "engine.language"),
    ("WHISPER_BEAM_SIZE", "engine.beam_size"),
    ("WHISPER_INITIAL_PROMPT", "engine.initial_prompt"),
    ("WHISPER_VAD_FILTER", "engine.vad_filter"),
    ("WHISPER_MIN_SILENCE_MS", "engine.min_silence_duration_ms"),
    ("API_KEY", "auth.api_key"),
    ("TEMP_DIR", "storage.temp_dir"),
];

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section is owned by one part of the service: the HTTP server, the
/// recognition engine, request authentication, temporary storage and request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "0.0.0.0"`: Accept connections from any address (containers, PaaS)
/// - `host = "127.0.0.1"`: Only accept connections from localhost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Recognition engine settings, fixed for the lifetime of the process.
///
/// ## Fields:
/// - `model`: `tiny`, `base`, `small`, `medium`, `large`, `large-v3`, an `.en` variant,
///   or a full Hugging Face repository id such as `openai/whisper-small`
/// - `device`: `auto`, `cpu`, `cuda` or `metal`
/// - `workers`: model replicas loaded, and the maximum number of concurrent inferences
/// - `language`: forced language code; unset means detect per request
/// - `beam_size`: hypotheses kept per decoding step (wider = slower, more accurate)
/// - `initial_prompt`: priming text biasing recognition toward domain vocabulary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model: String,
    pub device: String,
    pub compute_type: String,
    pub workers: usize,
    pub language: Option<String>,
    pub beam_size: usize,
    pub initial_prompt: Option<String>,
    pub vad_filter: bool,
    pub min_silence_duration_ms: u32,
    pub condition_on_previous_text: bool,
}

impl EngineConfig {
    /// Per-call decoding options derived from the engine settings.
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            beam_size: self.beam_size,
            language: self.language.clone(),
            initial_prompt: self.initial_prompt.clone(),
            vad: self.vad_filter.then(|| VadParameters {
                min_silence_duration_ms: self.min_silence_duration_ms,
                ..VadParameters::default()
            }),
            condition_on_previous_text: self.condition_on_previous_text,
        }
    }
}

/// Shared-secret authentication. No secret means every request is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    /// Request header the secret is read from
    pub header: String,
}

impl AuthConfig {
    pub fn policy(&self) -> AuthPolicy {
        AuthPolicy::new(self.api_key.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for per-request temporary audio files
    pub temp_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted upload; larger requests get 413
    pub max_upload_bytes: usize,
    /// Upper bound on a transcription request; 0 disables the timeout
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 10000,
            },
            engine: EngineConfig {
                model: "base".to_string(),
                device: "cpu".to_string(),
                compute_type: "f32".to_string(),
                workers: 1,
                language: None,
                beam_size: 5,
                initial_prompt: None,
                vad_filter: false,
                min_silence_duration_ms: VadParameters::default().min_silence_duration_ms,
                condition_on_previous_text: true,
            },
            auth: AuthConfig {
                api_key: None,
                header: "x-api-key".to_string(),
            },
            storage: StorageConfig {
                temp_dir: std::env::temp_dir().join("whisper-gateway"),
            },
            limits: LimitsConfig {
                max_upload_bytes: 25 * 1024 * 1024,
                request_timeout_secs: 0,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `PORT=3000`, `HOST=127.0.0.1`: deployment platform conventions
    /// - `WHISPER_MODEL=small`, `WHISPER_LANGUAGE=es`, `WHISPER_BEAM_SIZE=5`
    /// - `API_KEY=secret`: require `x-api-key: secret` on transcription requests
    /// - `APP_LIMITS__REQUEST_TIMEOUT_SECS=120`: any setting through the APP_ prefix
    pub fn load() -> Result<Self> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    /// Same as [`AppConfig::load`], reading conventional variables through `lookup`.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (variable, key) in CONVENTIONAL_ENV {
            if let Some(value) = lookup(variable) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        Ok(config.normalized())
    }

    /// Collapse empty strings to "unset" and canonicalise case.
    fn normalized(mut self) -> Self {
        fn non_empty(value: Option<String>) -> Option<String> {
            value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }

        self.engine.language = non_empty(self.engine.language)
            .map(|language| language.to_lowercase())
            .filter(|language| language != "auto");
        self.engine.initial_prompt = non_empty(self.engine.initial_prompt);
        self.engine.device = self.engine.device.trim().to_lowercase();
        self.engine.compute_type = self.engine.compute_type.trim().to_lowercase();
        self.auth.api_key = non_empty(self.auth.api_key);
        self.auth.header = self.auth.header.trim().to_lowercase();
        self
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching these at startup turns a misconfiguration into a clear error
    /// instead of failed requests later.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.engine.workers == 0 {
            return Err(anyhow::anyhow!("Engine workers must be greater than 0"));
        }

        if self.engine.beam_size == 0 {
            return Err(anyhow::anyhow!("Beam size must be greater than 0"));
        }

        if !SUPPORTED_COMPUTE_TYPES.contains(&self.engine.compute_type.as_str()) {
            return Err(anyhow::anyhow!(
                "Unsupported compute type '{}' (supported: {})",
                self.engine.compute_type,
                SUPPORTED_COMPUTE_TYPES.join(", ")
            ));
        }

        model::repository_for(&self.engine.model)?;

        self.engine
            .device
            .parse::<crate::device::DevicePreference>()
            .map_err(anyhow::Error::msg)?;

        if let Some(language) = &self.engine.language {
            if !model::LANGUAGES.contains(&language.as_str()) {
                return Err(anyhow::anyhow!("Unknown language code '{}'", language));
            }
        }

        if actix_web::http::header::HeaderName::from_bytes(self.auth.header.as_bytes()).is_err() {
            return Err(anyhow::anyhow!("Invalid auth header name '{}'", self.auth.header));
        }

        if self.limits.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Upload limit must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::load_with(|name| vars.get(name).cloned()).unwrap()
    }

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 10000);
        assert_eq!(config.engine.model, "base");
        assert_eq!(config.engine.workers, 1);
        assert_eq!(config.engine.beam_size, 5);
        assert_eq!(config.auth.header, "x-api-key");
        assert_eq!(config.limits.max_upload_bytes, 25 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.beam_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.compute_type = "int8".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.language = Some("klingon".to_string());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.model = "gigantic".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.limits.max_upload_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conventional_variables_override_defaults() {
        let config = load(&[
            ("PORT", "8080"),
            ("WHISPER_MODEL", "small"),
            ("WHISPER_WORKERS", "3"),
            ("WHISPER_LANGUAGE", "ES"),
            ("WHISPER_BEAM_SIZE", "2"),
            ("WHISPER_VAD_FILTER", "true"),
            ("API_KEY", "s3cret"),
            ("TEMP_DIR", "/var/tmp/gw"),
        ]);

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.model, "small");
        assert_eq!(config.engine.workers, 3);
        assert_eq!(config.engine.language.as_deref(), Some("es"));
        assert_eq!(config.engine.beam_size, 2);
        assert!(config.engine.vad_filter);
        assert_eq!(config.auth.api_key.as_deref(), Some("s3cret"));
        assert_eq!(config.storage.temp_dir, PathBuf::from("/var/tmp/gw"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_values_mean_unset() {
        let config = load(&[("API_KEY", ""), ("WHISPER_LANGUAGE", "  "), ("WHISPER_INITIAL_PROMPT", "")]);
        assert!(config.auth.api_key.is_none());
        assert!(config.engine.language.is_none());
        assert!(config.engine.initial_prompt.is_none());

        let config = load(&[("WHISPER_LANGUAGE", "auto")]);
        assert!(config.engine.language.is_none());
    }

    #[test]
    fn test_decode_options_follow_engine_settings() {
        let mut config = AppConfig::default();
        config.engine.language = Some("es".to_string());
        config.engine.initial_prompt = Some("n8n, cal.com".to_string());
        config.engine.vad_filter = true;
        config.engine.min_silence_duration_ms = 500;

        let options = config.engine.decode_options();
        assert_eq!(options.beam_size, 5);
        assert_eq!(options.language.as_deref(), Some("es"));
        assert_eq!(options.initial_prompt.as_deref(), Some("n8n, cal.com"));
        assert_eq!(options.vad.map(|v| v.min_silence_duration_ms), Some(500));

        config.engine.vad_filter = false;
        assert!(config.engine.decode_options().vad.is_none());
    }
}
