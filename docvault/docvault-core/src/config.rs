//! Repository configuration.
//!
//! Values come from an optional TOML file and are then overridden by
//! `DOCVAULT_*` environment variables. Missing keys fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What `delete` does to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Mark the subtree inactive; an administrator can restore it.
    Soft,
    /// Remove the subtree and its version history.
    Physical,
}

impl std::str::FromStr for DeletePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soft" => Ok(DeletePolicy::Soft),
            "physical" | "hard" => Ok(DeletePolicy::Physical),
            other => Err(ConfigError::Invalid(format!("unknown delete policy {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Name clients pass as the login target.
    #[serde(default = "default_repository_name")]
    pub repository_name: String,

    #[serde(default = "default_delete_policy")]
    pub delete_policy: DeletePolicy,

    /// Sessions unused for longer than this are evicted (default 30 min)
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Period of the eviction sweep (default 60 s)
    #[serde(default = "default_eviction_period")]
    pub eviction_period_secs: u64,

    /// Administrator account created on first start.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    #[serde(default = "default_admin_password")]
    pub admin_password: String,

    /// Internal principal that owns the repository root.
    #[serde(default = "default_system_user")]
    pub system_user: String,

    /// Highest `[n]` suffix tried when disambiguating sibling names.
    #[serde(default = "default_max_name_suffix")]
    pub max_name_suffix: u32,

    /// JSON file the reference engine persists to on flush.
    #[serde(default)]
    pub data_file: Option<PathBuf>,

    /// Argon2 memory cost in KiB for password hashes.
    #[serde(default = "default_password_memory_kib")]
    pub password_memory_kib: u32,

    #[serde(default = "default_password_iterations")]
    pub password_iterations: u32,
}

fn default_repository_name() -> String { "default".to_string() }
fn default_delete_policy() -> DeletePolicy { DeletePolicy::Soft }
fn default_idle_timeout() -> u64 { 1800 }
fn default_eviction_period() -> u64 { 60 }
fn default_admin_user() -> String { "admin".to_string() }
fn default_admin_password() -> String { "admin".to_string() }
fn default_system_user() -> String { "system".to_string() }
fn default_max_name_suffix() -> u32 { 1000 }
fn default_password_memory_kib() -> u32 { 19 * 1024 }
fn default_password_iterations() -> u32 { 2 }

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            repository_name: default_repository_name(),
            delete_policy: default_delete_policy(),
            session_idle_timeout_secs: default_idle_timeout(),
            eviction_period_secs: default_eviction_period(),
            admin_user: default_admin_user(),
            admin_password: default_admin_password(),
            system_user: default_system_user(),
            max_name_suffix: default_max_name_suffix(),
            data_file: None,
            password_memory_kib: default_password_memory_kib(),
            password_iterations: default_password_iterations(),
        }
    }
}

impl VaultConfig {
    /// Load from `path` if given and present, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `DOCVAULT_*` overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DOCVAULT_REPOSITORY_NAME") {
            self.repository_name = v;
        }
        if let Some(v) = lookup("DOCVAULT_DELETE_POLICY") {
            self.delete_policy = v.parse()?;
        }
        if let Some(v) = lookup("DOCVAULT_SESSION_IDLE_TIMEOUT_SECS") {
            self.session_idle_timeout_secs = parse_u64("DOCVAULT_SESSION_IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DOCVAULT_EVICTION_PERIOD_SECS") {
            self.eviction_period_secs = parse_u64("DOCVAULT_EVICTION_PERIOD_SECS", &v)?;
        }
        if let Some(v) = lookup("DOCVAULT_ADMIN_USER") {
            self.admin_user = v;
        }
        if let Some(v) = lookup("DOCVAULT_ADMIN_PASSWORD") {
            self.admin_password = v;
        }
        if let Some(v) = lookup("DOCVAULT_DATA_FILE") {
            self.data_file = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository_name.trim().is_empty() {
            return Err(ConfigError::Invalid("repository_name is empty".into()));
        }
        if self.eviction_period_secs == 0 {
            return Err(ConfigError::Invalid("eviction_period_secs must be positive".into()));
        }
        if self.password_memory_kib < 8 || self.password_iterations == 0 {
            return Err(ConfigError::Invalid("password hashing cost too low".into()));
        }
        if self.admin_user == self.system_user {
            return Err(ConfigError::Invalid(
                "admin_user and system_user must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn eviction_period(&self) -> Duration {
        Duration::from_secs(self.eviction_period_secs)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key} is not a number: {value}")))
}
