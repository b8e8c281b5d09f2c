//! Maestro Configuration Module
//!
//! Engine-wide execution policy: loop caps, agent timeouts, parallel
//! failure policy. Config is stored in `~/.config/maestro/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`MAESTRO_MAX_ITERATIONS`, `MAESTRO_AGENT_TIMEOUT_MS`,
//!    `MAESTRO_PARALLEL_POLICY`, `MAESTRO_LOOP_EXCEEDED`, `DRY_RUN`)
//! 2. Config file (`~/.config/maestro/config.toml`)
//! 3. Defaults (see `util::constants`)

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MaestroError, Result};
use crate::util::{AGENT_TIMEOUT, DEFAULT_MAX_ITERATIONS, MAX_ITERATIONS_CEILING};

/// What a Parallel node does when one branch fails without a handler
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParallelPolicy {
    /// Cancel still-running siblings and fail the node immediately
    #[default]
    FailFast,
    /// Let every branch finish, then fail with the first failure in declared order
    WaitAll,
}

impl FromStr for ParallelPolicy {
    type Err = MaestroError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            "wait_all" | "wait-all" => Ok(Self::WaitAll),
            other => Err(MaestroError::Config {
                reason: format!("unknown parallel policy '{}' (fail_fast, wait_all)", other),
            }),
        }
    }
}

/// What happens when a loop reaches its cap before `until` holds
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopExceeded {
    /// Raise `LoopBoundExceeded` (fatal unless a handler absorbs it)
    #[default]
    Fail,
    /// Stop looping, log a warning, continue after the loop
    Stop,
}

impl FromStr for LoopExceeded {
    type Err = MaestroError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "stop" => Ok(Self::Stop),
            other => Err(MaestroError::Config {
                reason: format!("unknown loop_exceeded policy '{}' (fail, stop)", other),
            }),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Cap for loops that do not declare `max_iterations`
    pub max_iterations: u32,

    /// Largest cap a loop may declare
    pub max_iterations_ceiling: u32,

    /// Per agent call timeout, unless the step sets `timeout_ms`
    pub agent_timeout_ms: u64,

    pub parallel_policy: ParallelPolicy,

    pub loop_exceeded: LoopExceeded,

    /// Bind every declared agent to a mock
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_iterations_ceiling: MAX_ITERATIONS_CEILING,
            agent_timeout_ms: AGENT_TIMEOUT.as_millis() as u64,
            parallel_policy: ParallelPolicy::default(),
            loop_exceeded: LoopExceeded::default(),
            dry_run: false,
        }
    }
}

impl EngineConfig {
    /// Get the config directory path
    ///
    /// Returns `~/.config/maestro/` on Unix, `%APPDATA%/maestro/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("maestro")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from the default path
    ///
    /// Returns default config if file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path
    ///
    /// Returns default config if file doesn't exist.
    /// Returns error if file exists but is malformed or inconsistent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| MaestroError::Config {
            reason: format!("Failed to read config file: {}", e),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| MaestroError::Config {
            reason: format!("Failed to parse config file: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| MaestroError::Config {
                reason: format!("Failed to create config directory: {}", e),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| MaestroError::Config {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| MaestroError::Config {
            reason: format!("Failed to write config file: {}", e),
        })
    }

    /// Merge with environment variables
    ///
    /// Environment variables take precedence over config file values.
    pub fn with_env(mut self) -> Result<Self> {
        if let Some(v) = env_var("MAESTRO_MAX_ITERATIONS") {
            self.max_iterations = v.parse().map_err(|_| MaestroError::Config {
                reason: format!("MAESTRO_MAX_ITERATIONS must be an integer, got '{}'", v),
            })?;
        }
        if let Some(v) = env_var("MAESTRO_AGENT_TIMEOUT_MS") {
            self.agent_timeout_ms = v.parse().map_err(|_| MaestroError::Config {
                reason: format!("MAESTRO_AGENT_TIMEOUT_MS must be an integer, got '{}'", v),
            })?;
        }
        if let Some(v) = env_var("MAESTRO_PARALLEL_POLICY") {
            self.parallel_policy = v.parse()?;
        }
        if let Some(v) = env_var("MAESTRO_LOOP_EXCEEDED") {
            self.loop_exceeded = v.parse()?;
        }
        if env_var("DRY_RUN").is_some() {
            self.dry_run = true;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations that would break the loop termination guarantee
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(MaestroError::Config {
                reason: "max_iterations must be at least 1".to_string(),
            });
        }
        if self.max_iterations > self.max_iterations_ceiling {
            return Err(MaestroError::Config {
                reason: format!(
                    "max_iterations ({}) exceeds max_iterations_ceiling ({})",
                    self.max_iterations, self.max_iterations_ceiling
                ),
            });
        }
        if self.agent_timeout_ms == 0 {
            return Err(MaestroError::Config {
                reason: "agent_timeout_ms must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_config_path_contains_maestro() {
        let path = EngineConfig::config_path();
        assert!(path.to_string_lossy().contains("maestro"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.parallel_policy, ParallelPolicy::FailFast);
        assert_eq!(config.loop_exceeded, LoopExceeded::Fail);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = EngineConfig {
            max_iterations: 4,
            parallel_policy: ParallelPolicy::WaitAll,
            loop_exceeded: LoopExceeded::Stop,
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "parallel_policy = \"wait_all\"\n").unwrap();
        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.parallel_policy, ParallelPolicy::WaitAll);
        assert_eq!(config.max_iterations, DEFAULT_MAX_ITERATIONS);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_iterations = 0\n").unwrap();
        let err = EngineConfig::load_from(&path).unwrap_err();
        assert_eq!(err.code(), "MAESTRO-050");
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        env::set_var("MAESTRO_MAX_ITERATIONS", "3");
        env::set_var("MAESTRO_PARALLEL_POLICY", "wait-all");
        let config = EngineConfig::default().with_env();
        env::remove_var("MAESTRO_MAX_ITERATIONS");
        env::remove_var("MAESTRO_PARALLEL_POLICY");

        let config = config.unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.parallel_policy, ParallelPolicy::WaitAll);
    }

    #[test]
    #[serial]
    fn test_env_rejects_garbage() {
        env::set_var("MAESTRO_LOOP_EXCEEDED", "sometimes");
        let result = EngineConfig::default().with_env();
        env::remove_var("MAESTRO_LOOP_EXCEEDED");
        assert!(result.is_err());
    }
}
