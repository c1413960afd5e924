//! Configuration loading.
//!
//! Loads `config.toml` from `$CLINIC_KERNEL_CONFIG` or `~/.clinic-kernel/`.
//! Precedence: env vars > config file > defaults. A missing file yields the
//! defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::identity::Role;

/// Top-level kernel configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backing store settings.
    pub database: DatabaseConfig,
    /// Audit recorder limits.
    pub audit: AuditConfig,
    /// Retry policy for transient storage errors.
    pub retry: RetryConfig,
    /// Role defaults and feature gates.
    pub permissions: PermissionsConfig,
    /// Integrity monitor settings.
    pub integrity: IntegrityConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// SQLite settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file path. Relative paths resolve against the config dir.
    pub path: PathBuf,
    /// Pool size shared by all tenants.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("clinic.db"),
            max_connections: 8,
        }
    }
}

/// Audit recorder limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Serialized size above which before/after values are summarized.
    pub max_value_bytes: usize,
    /// Upper bound on the page size accepted by the audit read path.
    pub max_page_size: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_value_bytes: 16 * 1024,
            max_page_size: 500,
        }
    }
}

/// Retry policy for transient storage errors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before attempt `n` is `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 25,
        }
    }
}

/// Role defaults and feature gates layered over the built-in clinic table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Replacement permission lists per role.
    pub roles: BTreeMap<Role, Vec<String>>,
    /// Permission namespace -> feature name that must be enabled.
    pub feature_gates: BTreeMap<String, String>,
}

/// Integrity monitor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Seconds between periodic sweeps.
    pub interval_secs: u64,
    /// Offending ids reported per finding.
    pub sample_size: u32,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            sample_size: 10,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for JSON log files. Defaults to `<config dir>/logs`.
    pub logs_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration with precedence env > file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path_with(|key| std::env::var(key).ok())?;
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, without env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has unknown role names.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests need not mutate the process env.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("CLINIC_KERNEL_DB") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = env("CLINIC_KERNEL_MAX_CONNECTIONS") {
            match v.parse() {
                Ok(n) => self.database.max_connections = n,
                Err(_) => tracing::warn!(
                    var = "CLINIC_KERNEL_MAX_CONNECTIONS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("CLINIC_KERNEL_AUDIT_MAX_BYTES") {
            match v.parse() {
                Ok(n) => self.audit.max_value_bytes = n,
                Err(_) => tracing::warn!(
                    var = "CLINIC_KERNEL_AUDIT_MAX_BYTES",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("CLINIC_KERNEL_LOGS_DIR") {
            self.logging.logs_dir = Some(PathBuf::from(v));
        }
    }

    /// Database path, resolved against `base` when relative.
    pub fn database_path(&self, base: &Path) -> PathBuf {
        if self.database.path.is_absolute() {
            self.database.path.clone()
        } else {
            base.join(&self.database.path)
        }
    }
}

/// Resolve the config file path using a custom env resolver.
///
/// # Errors
///
/// Returns an error if no home directory can be determined and
/// `$CLINIC_KERNEL_CONFIG` is unset.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(p) = env("CLINIC_KERNEL_CONFIG") {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve `~/.clinic-kernel`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".clinic-kernel"))
}
