//! Configuration module for Courier.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! addr = "0.0.0.0:8080"
//!
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [pod]
//! id = "pod-a"
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CourierConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub pod: PodConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Pod identity configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PodConfig {
    /// Stable identifier of this process instance. Defaults to the `POD_ID`
    /// environment variable, then the host name.
    #[serde(default)]
    pub id: Option<String>,
}

impl CourierConfig {
    /// Load configuration from the default path or COURIER_CONFIG env var.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("COURIER_CONFIG").unwrap_or_else(|_| "config/courier.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: CourierConfig = toml::from_str(&content)?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.addr.is_empty() {
            return Err(ConfigError::ValidationError(
                "server.addr must not be empty".to_string(),
            ));
        }

        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(ConfigError::ValidationError(format!(
                "redis.url must start with redis:// or rediss://, got '{}'",
                self.redis.url
            )));
        }

        // Check for unsubstituted env vars
        if self.redis.url.contains("${") {
            return Err(ConfigError::ValidationError(
                "redis.url contains an unsubstituted environment variable".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve this pod's identity: config, then `POD_ID`, then host name.
    pub fn pod_id(&self) -> String {
        if let Some(id) = &self.pod.id {
            if !id.is_empty() {
                return id.clone();
            }
        }

        if let Ok(id) = env::var("POD_ID") {
            if !id.is_empty() {
                return id;
            }
        }

        if let Ok(host) = hostname::get() {
            if let Some(name) = host.to_str() {
                return name.to_string();
            }
        }

        "pod-unknown".to_string()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("COURIER_TEST_VAR", "substituted_value");
        let input = "url = \"${COURIER_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("COURIER_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = CourierConfig::default();
        assert_eq!(config.server.addr, "0.0.0.0:8080");
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert!(config.pod.id.is_none());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            addr = "127.0.0.1:9090"
        "#;

        let config: CourierConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.addr, "127.0.0.1:9090");
        assert_eq!(config.redis.url, "redis://localhost:6379");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            addr = "0.0.0.0:8081"

            [redis]
            url = "redis://redis.internal:6379"

            [pod]
            id = "pod-7"
        "#;

        let config: CourierConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.redis.url, "redis://redis.internal:6379");
        assert_eq!(config.pod_id(), "pod-7");
    }

    #[test]
    fn test_validation_bad_redis_url() {
        let toml = r#"
            [redis]
            url = "localhost:6379"
        "#;

        let config: CourierConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pod_id_falls_back_to_hostname() {
        let config = CourierConfig::default();
        env::remove_var("POD_ID");
        // The fallback chain always produces a non-empty identity.
        assert!(!config.pod_id().is_empty());
    }
}
