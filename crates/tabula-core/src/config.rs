use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TabulaError};

/// Top-level configuration for Tabula.
///
/// Loaded from `~/.tabula/config.toml` by default. Every section is optional
/// in the file and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabulaConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl TabulaConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TabulaConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_question_chars == 0 {
            return Err(TabulaError::Config(
                "orchestrator.max_question_chars must be positive".to_string(),
            ));
        }
        if self.orchestrator.max_admin_steps == 0 {
            return Err(TabulaError::Config(
                "orchestrator.max_admin_steps must be positive".to_string(),
            ));
        }
        if self.approvals.ttl_secs == 0 {
            return Err(TabulaError::Config(
                "approvals.ttl_secs must be positive".to_string(),
            ));
        }
        if self.sessions.idle_timeout_minutes == 0 || self.sessions.sweep_interval_secs == 0 {
            return Err(TabulaError::Config(
                "sessions.idle_timeout_minutes and sessions.sweep_interval_secs must be positive"
                    .to_string(),
            ));
        }
        if self.database.max_rows == 0 {
            return Err(TabulaError::Config(
                "database.max_rows must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.tabula/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Global request body limit in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3040,
            max_body_bytes: 256 * 1024,
        }
    }
}

/// Turn orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Regenerations allowed after the first failed execution.
    pub max_retries: u32,
    /// Model steps allowed in one admin turn before it is cut off.
    pub max_admin_steps: usize,
    pub max_question_chars: usize,
    /// Model name used when a request does not name one.
    pub default_model: String,
}

impl OrchestratorConfig {
    pub const DEFAULT_MAX_RETRIES: u32 = 2;
    pub const DEFAULT_MAX_ADMIN_STEPS: usize = 16;
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            max_admin_steps: Self::DEFAULT_MAX_ADMIN_STEPS,
            max_question_chars: 4000,
            default_model: "rules".to_string(),
        }
    }
}

/// Session retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle longer than this are evicted.
    pub idle_timeout_minutes: u32,
    /// Turns kept per session for the history endpoint.
    pub history_limit: usize,
    /// How often the background sweeper runs.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: 60,
            history_limit: 20,
            sweep_interval_secs: 30,
        }
    }
}

/// Approval gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Pending approvals older than this are abandoned.
    pub ttl_secs: u64,
    /// How long resolved approvals are kept so late duplicates still report
    /// "already resolved".
    pub retain_resolved_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 900,
            retain_resolved_secs: 3600,
        }
    }
}

/// Execution database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. Empty means `<data_dir>/tabula.db`.
    pub path: String,
    /// Row cap for a single result set.
    pub max_rows: usize,
    /// Load the demo tables on startup.
    pub seed_demo: bool,
}

impl DatabaseConfig {
    pub const DEFAULT_MAX_ROWS: usize = 500;
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            max_rows: Self::DEFAULT_MAX_ROWS,
            seed_demo: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TabulaConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.server.port, 3040);
        assert_eq!(config.orchestrator.max_retries, 2);
        assert_eq!(config.sessions.history_limit, 20);
        assert_eq!(config.approvals.ttl_secs, 900);
        assert_eq!(config.database.max_rows, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let toml_str = r#"
            [orchestrator]
            max_retries = 4

            [server]
            port = 8080
        "#;
        let config: TabulaConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.orchestrator.max_retries, 4);
        assert_eq!(
            config.orchestrator.max_admin_steps,
            OrchestratorConfig::DEFAULT_MAX_ADMIN_STEPS
        );
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.approvals.retain_resolved_secs, 3600);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = TabulaConfig::default();
        config.sessions.idle_timeout_minutes = 5;
        config.database.seed_demo = true;
        config.save(&path).unwrap();

        let loaded = TabulaConfig::load(&path).unwrap();
        assert_eq!(loaded.sessions.idle_timeout_minutes, 5);
        assert!(loaded.database.seed_demo);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = TabulaConfig::load_or_default(&dir.path().join("absent.toml"));
        assert_eq!(config.server.port, 3040);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[database]\nmax_rows = 0\n").unwrap();

        let err = TabulaConfig::load(&path).unwrap_err();
        assert!(matches!(err, TabulaError::Config(_)));
        assert!(err.to_string().contains("max_rows"));
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(
            TabulaConfig::load(&path),
            Err(TabulaError::Config(_))
        ));
    }
}
