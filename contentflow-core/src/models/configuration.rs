//! Configuration data structures

use crate::models::workflow::StepKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Logging level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Logging verbosity level
    pub log_level: LogLevel,
    /// Server bind address
    pub server_host: String,
    /// Server port number
    pub server_port: u16,
    /// Session store file; platform data dir when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    /// Drive sessions to completion without explicit advance calls
    pub auto_advance: bool,
    pub admission: AdmissionConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub timeouts: StepTimeouts,
    pub capabilities: CapabilitiesConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            store_path: None,
            auto_advance: true,
            admission: AdmissionConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            timeouts: StepTimeouts::default(),
            capabilities: CapabilitiesConfig::default(),
        }
    }
}

/// Concurrency budget and queueing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum concurrently admitted workflows
    pub concurrency_budget: usize,
    /// Maximum waiting entries per lane
    pub max_queue_depth: usize,
    /// Step duration assumed before any step has completed
    pub initial_step_estimate_ms: u64,
    /// Number of recent step durations averaged for wait estimates
    pub rolling_window: usize,
    /// How long a queued request may wait before it is rejected
    pub queue_timeout_seconds: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            concurrency_budget: 100,
            max_queue_depth: 1000,
            initial_step_estimate_ms: 2000,
            rolling_window: 50,
            queue_timeout_seconds: 300,
        }
    }
}

impl AdmissionConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_seconds)
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per step execution, first call included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Multiplier applied per further retry
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay
    pub max_delay_ms: u64,
    /// Extra random delay as a fraction of the computed delay (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
        }
    }
}

/// Hard per-call upper bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTimeouts {
    pub content_generation_ms: u64,
    pub visual_generation_ms: u64,
    pub optimization_ms: u64,
    pub packaging_ms: u64,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            content_generation_ms: 10_000,
            visual_generation_ms: 10_000,
            optimization_ms: 30_000,
            packaging_ms: 30_000,
        }
    }
}

impl StepTimeouts {
    pub fn for_step(&self, kind: StepKind) -> Duration {
        let ms = match kind {
            StepKind::ContentGeneration => self.content_generation_ms,
            StepKind::VisualGeneration => self.visual_generation_ms,
            StepKind::Optimization => self.optimization_ms,
            StepKind::Packaging => self.packaging_ms,
        };
        Duration::from_millis(ms)
    }
}

/// How a step's external capability is reached
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapabilityConfig {
    /// Bash command reading the payload on stdin and printing the output on stdout
    Command { command: String },
    /// JSON-over-HTTP endpoint
    Http {
        url: String,
        /// Environment variable holding a bearer token
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_env: Option<String>,
    },
}

/// Capability wiring, one entry per step
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CapabilitiesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_generation: Option<CapabilityConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_generation: Option<CapabilityConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization: Option<CapabilityConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packaging: Option<CapabilityConfig>,
}

impl CapabilitiesConfig {
    pub fn get(&self, kind: StepKind) -> Option<&CapabilityConfig> {
        match kind {
            StepKind::ContentGeneration => self.content_generation.as_ref(),
            StepKind::VisualGeneration => self.visual_generation.as_ref(),
            StepKind::Optimization => self.optimization.as_ref(),
            StepKind::Packaging => self.packaging.as_ref(),
        }
    }
}

impl Configuration {
    /// Load configuration from file, falling back to defaults when it is missing
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Configuration =
                toml::from_str(&content).context("Failed to parse config file")?;
            Ok(config)
        } else {
            Ok(Configuration::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("contentflow").join("config.toml"))
    }

    /// Session store file in effect
    pub fn resolved_store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("contentflow")
                .join("sessions.json")
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server_port < 1024 {
            errors.push(
                "server_port must be at least 1024 (privileged ports not allowed)".to_string(),
            );
        }

        if self.admission.concurrency_budget == 0 {
            errors.push("admission.concurrency_budget must be at least 1".to_string());
        }
        if self.admission.rolling_window == 0 {
            errors.push("admission.rolling_window must be at least 1".to_string());
        }
        if self.admission.initial_step_estimate_ms == 0 {
            errors.push("admission.initial_step_estimate_ms must be positive".to_string());
        }

        if self.breaker.failure_threshold == 0 {
            errors.push("breaker.failure_threshold must be at least 1".to_string());
        }

        if !(1..=10).contains(&self.retry.max_attempts) {
            errors.push("retry.max_attempts must be between 1 and 10".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            errors.push("retry.backoff_multiplier cannot be below 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            errors.push("retry.jitter_factor must be between 0.0 and 1.0".to_string());
        }

        for kind in StepKind::ALL {
            if self.timeouts.for_step(kind).is_zero() {
                errors.push(format!("timeouts for {} must be positive", kind));
            }
            match self.capabilities.get(kind) {
                Some(CapabilityConfig::Command { command }) if command.trim().is_empty() => {
                    errors.push(format!("capability command for {} is empty", kind));
                }
                Some(CapabilityConfig::Http { url, .. }) if url::Url::parse(url).is_err() => {
                    errors.push(format!("capability url for {} is not a valid URL", kind));
                }
                _ => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.admission.concurrency_budget, 100);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown(), Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.timeouts.for_step(StepKind::ContentGeneration),
            Duration::from_secs(10)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configuration_validation() {
        let mut config = Configuration {
            server_port: 80,
            ..Configuration::default()
        };
        config.retry.max_attempts = 0;
        config.capabilities.packaging = Some(CapabilityConfig::Http {
            url: "not a url".to_string(),
            token_env: None,
        });

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("server_port")));
        assert!(errors.iter().any(|e| e.contains("max_attempts")));
        assert!(errors.iter().any(|e| e.contains("packaging")));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Configuration = toml::from_str(
            r#"
            auto_advance = false

            [admission]
            concurrency_budget = 4

            [capabilities.content_generation]
            type = "command"
            command = "./gen-text.sh"
            "#,
        )
        .unwrap();

        assert!(!config.auto_advance);
        assert_eq!(config.admission.concurrency_budget, 4);
        assert_eq!(config.admission.rolling_window, 50);
        assert_eq!(
            config.capabilities.get(StepKind::ContentGeneration),
            Some(&CapabilityConfig::Command {
                command: "./gen-text.sh".to_string()
            })
        );
        assert!(config.capabilities.get(StepKind::Packaging).is_none());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = Configuration::default();
        config.server_port = 9090;
        config.save_to_file(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded = Configuration::load_from_file(&config_path).unwrap();
        assert_eq!(loaded.server_port, 9090);

        let missing = Configuration::load_from_file(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.server_port, 8080);
    }
}
