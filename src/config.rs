//! Configuration loading
//!
//! Settings come from three layers, highest precedence first:
//! command-line flags, `LINESCOPE_*` environment variables, then a TOML file.
//!
//! # Example linescope.toml
//!
//! ```toml
//! [instrumentation]
//! include = ["com/acme/"]
//! class_regex = "org/example/.*Service"
//! exclude = ["com/acme/generated/"]
//! dispatch = "auto"          # auto | dynamic | static
//!
//! [web]
//! port = 54321               # 0 picks a free port
//!
//! [source]
//! path = "src/main/java"
//!
//! [registry]
//! update_interval_ms = 200
//! ```

use crate::filter::ClassFilter;
use crate::planner::DispatchMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 54321;
pub const DEFAULT_SOURCE_PATH: &str = "src/main/java";
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 200;

pub const ENV_PORT: &str = "LINESCOPE_PORT";
pub const ENV_CLASS_REGEX: &str = "LINESCOPE_CLASS_REGEX";
pub const ENV_INCLUDE: &str = "LINESCOPE_INCLUDE";
pub const ENV_EXCLUDE: &str = "LINESCOPE_EXCLUDE";
pub const ENV_SOURCE_PATH: &str = "LINESCOPE_SOURCE_PATH";
pub const ENV_UPDATE_INTERVAL_MS: &str = "LINESCOPE_UPDATE_INTERVAL_MS";
pub const ENV_DISPATCH: &str = "LINESCOPE_DISPATCH";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No include rule configured: set instrumentation.include or instrumentation.class_regex")]
    NoIncludeRule,

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("registry.update_interval_ms must be greater than zero")]
    ZeroInterval,

    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },
}

/// Root configuration for linescope.toml
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub instrumentation: InstrumentationConfig,
    pub web: WebConfig,
    pub source: SourceConfig,
    pub registry: RegistryConfig,
}

/// Which classes to rewrite and how
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Internal-name prefixes to include
    pub include: Vec<String>,
    /// Regex that must match the entire internal name
    pub class_regex: Option<String>,
    pub exclude: Vec<String>,
    pub exclude_regex: Option<String>,
    pub dispatch: DispatchMode,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub path: Option<PathBuf>,
}

impl SourceConfig {
    /// Source lookup root; relative to the working directory by default
    pub fn root(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE_PATH))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub update_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
        }
    }
}

impl RegistryConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML")
    }

    /// File (if any) overlaid with the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        Ok(config)
    }

    /// Apply `LINESCOPE_*` variables; unrelated variables are ignored
    ///
    /// List-valued variables are comma separated. Include and exclude lists
    /// replace the configured lists rather than extending them.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (var, value) in vars {
            let invalid = |reason: String| ConfigError::InvalidEnv {
                var: var.clone(),
                value: value.clone(),
                reason,
            };
            match var.as_str() {
                ENV_PORT => {
                    self.web.port = value.trim().parse().map_err(|e| invalid(format!("{e}")))?;
                }
                ENV_UPDATE_INTERVAL_MS => {
                    self.registry.update_interval_ms =
                        value.trim().parse().map_err(|e| invalid(format!("{e}")))?;
                }
                ENV_CLASS_REGEX => self.instrumentation.class_regex = Some(value.clone()),
                ENV_INCLUDE => self.instrumentation.include = split_list(&value),
                ENV_EXCLUDE => self.instrumentation.exclude = split_list(&value),
                ENV_SOURCE_PATH => self.source.path = Some(PathBuf::from(&value)),
                ENV_DISPATCH => {
                    self.instrumentation.dispatch = value.parse().map_err(invalid)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Check the configuration is usable for instrumentation
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rules = &self.instrumentation;
        if rules.include.iter().all(|p| p.trim().is_empty()) && rules.class_regex.is_none() {
            return Err(ConfigError::NoIncludeRule);
        }
        for pattern in rules.class_regex.iter().chain(rules.exclude_regex.iter()) {
            regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        if self.registry.update_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    /// Class filter built from the instrumentation rules
    pub fn class_filter(&self) -> Result<ClassFilter> {
        let rules = &self.instrumentation;
        ClassFilter::from_rules(
            &rules.include,
            rules.class_regex.as_deref(),
            &rules.exclude,
            rules.exclude_regex.as_deref(),
        )
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
