//! CLI argument definitions for the Tabula server.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

use tabula_core::config::TabulaConfig;

/// Tabula - ask questions of a SQL database in plain language, with human
/// approval for anything that changes it.
#[derive(Parser, Debug, Default)]
#[command(name = "tabula", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// API server port.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// SQLite database file to query.
    #[arg(short = 'd', long = "database")]
    pub database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Load the demo tables before serving.
    #[arg(long = "seed-demo")]
    pub seed_demo: bool,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > TABULA_CONFIG env var > ~/.tabula/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("TABULA_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the API server port.
    ///
    /// Priority: --port flag > TABULA_PORT env var > config file value.
    pub fn resolve_port(&self, config_port: u16) -> u16 {
        if let Some(p) = self.port {
            return p;
        }
        if let Ok(val) = std::env::var("TABULA_PORT") {
            if let Ok(p) = val.parse::<u16>() {
                return p;
            }
        }
        config_port
    }

    /// Resolve the database path.
    ///
    /// Priority: --database flag > TABULA_DATABASE env var > config file
    /// value. Returns `None` when none is set (use `<data_dir>/tabula.db`).
    pub fn resolve_database(&self, config_path: &str) -> Option<PathBuf> {
        if let Some(ref p) = self.database {
            return Some(p.clone());
        }
        if let Ok(p) = std::env::var("TABULA_DATABASE") {
            return Some(PathBuf::from(p));
        }
        (!config_path.is_empty()).then(|| PathBuf::from(config_path))
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }

    /// Fold the overrides into a loaded configuration.
    pub fn apply(&self, config: &mut TabulaConfig) {
        config.server.port = self.resolve_port(config.server.port);
        config.general.log_level = self.resolve_log_level(&config.general.log_level);
        if let Some(path) = self.resolve_database(&config.database.path) {
            config.database.path = path.to_string_lossy().to_string();
        }
        config.database.seed_demo |= self.seed_demo;
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".tabula").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".tabula").join("config.toml");
    }
    PathBuf::from("config.toml")
}
