//! Ledger configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Enable WAL journal mode
    #[serde(default = "default_true")]
    pub wal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Balances within this distance of zero count as zero
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Stored-vs-computed differences at or above this are major
    #[serde(default = "default_major_threshold")]
    pub major_discrepancy_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// tracing EnvFilter directive, used when RUST_LOG is unset
    #[serde(default = "default_filter")]
    pub filter: String,
}

// Defaults
fn default_db_path() -> PathBuf { PathBuf::from("microloan.db") }
fn default_true() -> bool { true }
fn default_tolerance() -> f64 { 0.01 }
fn default_major_threshold() -> f64 { 10.0 }
fn default_bind() -> String { "0.0.0.0:3000".to_string() }
fn default_filter() -> String { "info".to_string() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            wal: default_true(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            major_discrepancy_threshold: default_major_threshold(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: default_filter() }
    }
}

impl LedgerConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: LedgerConfig = toml::from_str(content)
            .map_err(|e| LedgerError::Validation(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from file; a missing file means defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        let rec = &self.reconciliation;
        if !(rec.tolerance >= 0.0) {
            return Err(LedgerError::Validation(
                "reconciliation.tolerance must be >= 0".to_string(),
            ));
        }
        if rec.major_discrepancy_threshold < rec.tolerance {
            return Err(LedgerError::Validation(
                "reconciliation.major_discrepancy_threshold must be >= tolerance".to_string(),
            ));
        }
        Ok(())
    }
}
