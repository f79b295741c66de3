//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (APP_ prefix, double underscore as separator)
//! - Built-in defaults
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__HOST, APP_LIFECYCLE__IDLE_TIMEOUT_SECS, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Model sizes the recognizer loader accepts.
const KNOWN_MODEL_SIZES: &[&str] = &["tiny", "base", "small", "medium", "large"];

/// Top-level application configuration.
///
/// Broken into logical groups so each subsystem reads only its own section:
/// the HTTP server, the recognizer model, the resource lifecycle, and
/// capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub lifecycle: LifecycleConfig,
    pub performance: PerformanceConfig,
}

/// HTTP server bind settings.
///
/// - `host = "127.0.0.1"`: localhost only (development)
/// - `host = "0.0.0.0"`: accept connections from any address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Recognizer model settings, consumed by the loader at each load.
///
/// ## Fields:
/// - `size`: Whisper variant ("tiny", "base", "small", "medium", "large")
/// - `device`: compute device preference ("auto", "cpu", "cuda", "metal")
/// - `compute`: weight precision hint ("int8", "float16", "float32")
/// - `language`: ISO 639-1 transcription language hint, empty for auto-detect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub size: String,
    pub device: String,
    pub compute: String,
    pub language: String,
}

/// Resource lifecycle timing.
///
/// ## Fields:
/// - `idle_timeout_secs`: how long the model may sit unused before eviction
/// - `idle_check_interval_secs`: how often the idle monitor wakes up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub idle_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
}

/// Capacity limits, used for load reporting on the health endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8765,
            },
            model: ModelConfig {
                size: "small".to_string(),      // Balanced speed and accuracy
                device: "auto".to_string(),     // GPU when available, else CPU
                compute: "int8".to_string(),
                language: "en".to_string(),
            },
            lifecycle: LifecycleConfig {
                idle_timeout_secs: 300,         // Unload after 5 idle minutes
                idle_check_interval_secs: 10,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, then config.toml, then environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: override the server port
    /// - `APP_MODEL__SIZE=medium`: override the recognizer size
    /// - `HOST` / `PORT`: special cases used by deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        // Deployment platforms commonly inject these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the configuration values make sense before the server
    /// starts. Catching these early beats a confusing runtime failure.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !KNOWN_MODEL_SIZES.contains(&self.model.size.as_str()) {
            return Err(anyhow::anyhow!(
                "Unknown model size '{}' (expected one of {:?})",
                self.model.size,
                KNOWN_MODEL_SIZES
            ));
        }

        if self.lifecycle.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }

        if self.lifecycle.idle_check_interval_secs == 0 {
            return Err(anyhow::anyhow!("Idle check interval must be greater than 0"));
        }

        if self.lifecycle.idle_check_interval_secs > self.lifecycle.idle_timeout_secs {
            return Err(anyhow::anyhow!(
                "Idle check interval ({}s) cannot exceed the idle timeout ({}s)",
                self.lifecycle.idle_check_interval_secs,
                self.lifecycle.idle_timeout_secs
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON document.
    ///
    /// Only the fields present in the JSON are touched, so a client can send
    /// `{"model": {"size": "medium"}}` without restating everything else.
    /// The merged result is re-validated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(model) = partial.get("model") {
            if let Some(size) = model.get("size").and_then(|v| v.as_str()) {
                self.model.size = size.to_string();
            }
            if let Some(device) = model.get("device").and_then(|v| v.as_str()) {
                self.model.device = device.to_string();
            }
            if let Some(compute) = model.get("compute").and_then(|v| v.as_str()) {
                self.model.compute = compute.to_string();
            }
            if let Some(language) = model.get("language").and_then(|v| v.as_str()) {
                self.model.language = language.to_string();
            }
        }

        if let Some(lifecycle) = partial.get("lifecycle") {
            if let Some(timeout) = lifecycle.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.lifecycle.idle_timeout_secs = timeout;
            }
            if let Some(interval) = lifecycle
                .get("idle_check_interval_secs")
                .and_then(|v| v.as_u64())
            {
                self.lifecycle.idle_check_interval_secs = interval;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.model.size, "small");
        assert_eq!(config.lifecycle.idle_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_rejects_zero_port() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_unknown_model_size() {
        let mut config = AppConfig::default();
        config.model.size = "gigantic".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_interval_exceeding_timeout() {
        let mut config = AppConfig::default();
        config.lifecycle.idle_timeout_secs = 5;
        config.lifecycle.idle_check_interval_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_partial_update() {
        let mut config = AppConfig::default();
        let json = r#"{"model": {"size": "medium"}, "lifecycle": {"idle_timeout_secs": 60}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.model.size, "medium");
        assert_eq!(config.lifecycle.idle_timeout_secs, 60);
        // Untouched fields keep their previous values
        assert_eq!(config.server.port, 8765);
    }

    #[test]
    fn test_config_update_rejects_invalid_merge() {
        let mut config = AppConfig::default();
        let json = r#"{"lifecycle": {"idle_timeout_secs": 1, "idle_check_interval_secs": 30}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
