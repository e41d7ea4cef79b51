//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **struct**: Custom data types that group related fields together
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, CLOUD_API_KEY, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, models, providers,
/// cost, jobs, sink) makes it easier to understand and maintain as the
/// application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub providers: ProvidersConfig,
    pub cost: CostConfig,
    pub jobs: JobsConfig,
    pub sink: SinkConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
/// - `port = 8080`: Common development port (production often uses 80 or 443)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Local inference model configuration.
///
/// ## Fields:
/// - `whisper_model`: Which Whisper model to use locally ("tiny", "base", "small", "medium", "large")
/// - `device`: Compute device preference ("auto", "cpu", "cuda", "metal")
/// - `language`: Optional ISO 639-1 language hint passed to the decoder
///
/// ## Model size trade-offs:
/// - Smaller models: Faster processing, less memory, lower accuracy
/// - Larger models: Slower processing, more memory, higher accuracy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub device: String,
    pub language: Option<String>,
}

/// Cloud transcription provider configuration.
///
/// ## Fields:
/// - `cloud_api_url`: Base URL of an OpenAI-compatible transcription API
/// - `cloud_api_key`: Bearer token; when absent the cloud provider is
///   reported unavailable and `cloud`/`both` jobs are rejected up front
/// - `cloud_model`: Model name sent with each request
/// - `request_timeout_seconds`: Per-request HTTP timeout
/// - `max_retries`: How many times the orchestrator retries a transient
///   provider failure before converting it to a job error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub cloud_api_url: String,
    pub cloud_api_key: Option<String>,
    pub cloud_model: String,
    pub request_timeout_seconds: u64,
    pub max_retries: u8,
}

/// Cost model rates.
///
/// ## Why configuration, not constants:
/// Cloud pricing changes and local amortized hardware cost depends on the
/// deployment. Keeping both rates here keeps the cost module a pure function
/// of its inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// What the cloud API charges per audio minute (USD)
    pub cloud_rate_per_minute: f64,
    /// Amortized local compute cost per processing second (USD, may be zero)
    pub local_rate_per_second: f64,
}

/// Job engine tuning.
///
/// ## Fields:
/// - `max_live_jobs`: Upper bound on jobs held in the registry at once
/// - `retention_seconds`: How long a finished job stays queryable before the
///   sweeper evicts it
/// - `sweep_interval_seconds`: How often the background sweep runs
/// - `progress_buffer`: Capacity of each subscriber's broadcast buffer;
///   slow subscribers lose the oldest undelivered snapshots beyond this
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub max_live_jobs: usize,
    pub retention_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub progress_buffer: usize,
}

/// Finished-transcript sink configuration.
///
/// ## Behavior:
/// When `endpoint` is set, completed jobs POST a transcript record there,
/// fire-and-forget. When unset, records are only logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub endpoint: Option<String>,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration
/// file exists. They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,                     // Common development port
            },
            models: ModelsConfig {
                whisper_model: "base".to_string(),  // Fast enough for CPU development
                device: "auto".to_string(),
                language: Some("en".to_string()),
            },
            providers: ProvidersConfig {
                cloud_api_url: "https://api.openai.com/v1".to_string(),
                cloud_api_key: None,            // Cloud disabled until a key is supplied
                cloud_model: "whisper-1".to_string(),
                request_timeout_seconds: 120,
                max_retries: 2,
            },
            cost: CostConfig {
                cloud_rate_per_minute: 0.006,   // Reference cloud Whisper pricing
                local_rate_per_second: 0.0001,
            },
            jobs: JobsConfig {
                max_live_jobs: 32,
                retention_seconds: 300,         // Finished jobs linger 5 minutes
                sweep_interval_seconds: 60,
                progress_buffer: 16,
            },
            sink: SinkConfig { endpoint: None },
        }
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and CLOUD_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_SERVER_PORT=3000`: Override server port
    /// - `CLOUD_API_KEY=sk-...`: Enable the cloud provider
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists) - required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Example: APP_SERVER_HOST becomes server.host in the config
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Handle special environment variables used by deployment platforms
        // These don't follow the APP_ prefix convention but are commonly used
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // API keys conventionally live in their own variable, not the APP_ tree
        if let Ok(key) = env::var("CLOUD_API_KEY") {
            if !key.is_empty() {
                settings = settings.set_override("providers.cloud_api_key", key)?;
            }
        }

        // Build the final configuration and convert it back to our AppConfig struct
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## Why validate:
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.jobs.max_live_jobs == 0 {
            return Err(anyhow::anyhow!("Max live jobs must be greater than 0"));
        }

        if self.jobs.retention_seconds == 0 {
            return Err(anyhow::anyhow!("Job retention must be greater than 0 seconds"));
        }

        if self.jobs.progress_buffer == 0 {
            return Err(anyhow::anyhow!("Progress buffer capacity must be greater than 0"));
        }

        if self.cost.cloud_rate_per_minute < 0.0 || self.cost.local_rate_per_second < 0.0 {
            return Err(anyhow::anyhow!("Cost rates cannot be negative"));
        }

        if self.providers.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Provider request timeout must be greater than 0"));
        }

        Ok(())  // All validation passed
    }

    /// Whether the cloud provider can be offered to callers.
    ///
    /// ## Contract:
    /// `cloud` and `both` provider modes are rejected before job creation when
    /// this returns false.
    pub fn cloud_available(&self) -> bool {
        self.providers
            .cloud_api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// This method allows updating only some fields, not the entire
    /// configuration. For example, you can send just
    /// `{"cost": {"cloud_rate_per_minute": 0.004}}` to change only that rate.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        // Parse the JSON string into a generic value
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        // Update server configuration if provided
        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;  // Convert u64 to u16 for port number
            }
        }

        // Update model configuration if provided
        if let Some(models) = partial_config.get("models") {
            if let Some(whisper) = models.get("whisper_model").and_then(|v| v.as_str()) {
                self.models.whisper_model = whisper.to_string();
            }
            if let Some(device) = models.get("device").and_then(|v| v.as_str()) {
                self.models.device = device.to_string();
            }
            if let Some(language) = models.get("language").and_then(|v| v.as_str()) {
                self.models.language = Some(language.to_string());
            }
        }

        // Update provider configuration if provided
        if let Some(providers) = partial_config.get("providers") {
            if let Some(url) = providers.get("cloud_api_url").and_then(|v| v.as_str()) {
                self.providers.cloud_api_url = url.to_string();
            }
            if let Some(model) = providers.get("cloud_model").and_then(|v| v.as_str()) {
                self.providers.cloud_model = model.to_string();
            }
            if let Some(retries) = providers.get("max_retries").and_then(|v| v.as_u64()) {
                self.providers.max_retries = retries as u8;
            }
            if let Some(timeout) = providers.get("request_timeout_seconds").and_then(|v| v.as_u64()) {
                self.providers.request_timeout_seconds = timeout;
            }
        }

        // Update cost rates if provided
        if let Some(cost) = partial_config.get("cost") {
            if let Some(rate) = cost.get("cloud_rate_per_minute").and_then(|v| v.as_f64()) {
                self.cost.cloud_rate_per_minute = rate;
            }
            if let Some(rate) = cost.get("local_rate_per_second").and_then(|v| v.as_f64()) {
                self.cost.local_rate_per_second = rate;
            }
        }

        // Update job engine tuning if provided
        if let Some(jobs) = partial_config.get("jobs") {
            if let Some(max) = jobs.get("max_live_jobs").and_then(|v| v.as_u64()) {
                self.jobs.max_live_jobs = max as usize;
            }
            if let Some(retention) = jobs.get("retention_seconds").and_then(|v| v.as_u64()) {
                self.jobs.retention_seconds = retention;
            }
            if let Some(interval) = jobs.get("sweep_interval_seconds").and_then(|v| v.as_u64()) {
                self.jobs.sweep_interval_seconds = interval;
            }
        }

        // Validate the updated configuration to ensure it's still valid
        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;  // Import everything from the parent module

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cost.cloud_rate_per_minute, 0.006);
        // Ensure the default config passes validation
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;  // Invalid port
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.jobs.retention_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.cost.cloud_rate_per_minute = -1.0;
        assert!(config.validate().is_err());
    }

    /// Cloud availability follows the presence of a non-empty API key.
    #[test]
    fn test_cloud_availability() {
        let mut config = AppConfig::default();
        assert!(!config.cloud_available());

        config.providers.cloud_api_key = Some("  ".to_string());
        assert!(!config.cloud_available());

        config.providers.cloud_api_key = Some("sk-test".to_string());
        assert!(config.cloud_available());
    }

    /// Test that runtime configuration updates work correctly.
    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"cost": {"cloud_rate_per_minute": 0.004}, "jobs": {"retention_seconds": 120}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.cost.cloud_rate_per_minute, 0.004);
        assert_eq!(config.jobs.retention_seconds, 120);
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.models.whisper_model, "base");
    }

    /// Updates that violate validation are rejected.
    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        let json = r#"{"jobs": {"max_live_jobs": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
