//! Configuration management module
//!
//! Handles loading, validation, and management of application configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address the TCP server listens on
    pub listen_addr: String,

    /// Prompt written before every line read
    pub prompt: String,

    /// Maximum number of concurrently running sessions
    pub max_sessions: usize,

    /// Consecutive failed reads tolerated before a session gives up; 0
    /// retries forever
    pub max_consecutive_read_errors: u32,

    /// Time given to open sessions to finish after shutdown is requested
    pub shutdown_grace_ms: u64,

    /// Logging level
    pub log_level: String,

    /// File-based logging configuration
    pub log: LogConfig,

    /// Terminal geometry reported to sessions
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Optional log file; logs go to stderr only when unset
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub width: u16,
    pub height: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2323".to_string(),
            prompt: "> ".to_string(),
            max_sessions: 64,
            max_consecutive_read_errors: 16,
            shutdown_grace_ms: 2000,
            log_level: "info".to_string(),
            log: LogConfig::default(),
            terminal: TerminalConfig::default(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment variable overrides applied, validated
    pub fn from_env() -> Result<Self> {
        Self::from_overrides(|key| env::var(key).ok())
    }

    fn from_overrides<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_overrides(lookup);
        config
            .validate()
            .context("Invalid configuration from environment")?;
        Ok(config)
    }

    /// Absolute form of a config file path, relative to the working directory
    pub fn resolve_path<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
        std::path::absolute(&path)
            .with_context(|| format!("Failed to resolve path: {}", path.as_ref().display()))
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // SHELLGATE_LISTEN_ADDR - server listen address
        if let Some(addr) = lookup("SHELLGATE_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        // SHELLGATE_PROMPT - session prompt
        if let Some(prompt) = lookup("SHELLGATE_PROMPT") {
            self.prompt = prompt;
        }

        // SHELLGATE_MAX_SESSIONS - concurrent session limit
        if let Some(max) = lookup("SHELLGATE_MAX_SESSIONS") {
            if let Ok(value) = max.parse::<usize>() {
                self.max_sessions = value;
            }
        }

        // SHELLGATE_LOG_LEVEL - logging level
        if let Some(log_level) = lookup("SHELLGATE_LOG_LEVEL") {
            self.log_level = log_level;
        }

        // SHELLGATE_LOG_FILE_PATH - logging destination file
        if let Some(file_path) = lookup("SHELLGATE_LOG_FILE_PATH") {
            if !file_path.trim().is_empty() {
                self.log.file_path = Some(file_path);
            }
        }

        // SHELLGATE_TERMINAL_WIDTH / SHELLGATE_TERMINAL_HEIGHT - geometry
        if let Some(width) = lookup("SHELLGATE_TERMINAL_WIDTH") {
            if let Ok(value) = width.parse::<u16>() {
                self.terminal.width = value;
            }
        }
        if let Some(height) = lookup("SHELLGATE_TERMINAL_HEIGHT") {
            if let Ok(value) = height.parse::<u16>() {
                self.terminal.height = value;
            }
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Serialize configuration as pretty TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen_addr: {}", self.listen_addr))?;

        if self.prompt.contains(['\r', '\n']) {
            anyhow::bail!("Prompt must not contain line breaks");
        }

        if self.max_sessions == 0 {
            anyhow::bail!("max_sessions must be greater than 0");
        }

        if self.terminal.width == 0 || self.terminal.height == 0 {
            anyhow::bail!("Terminal dimensions must be greater than 0");
        }

        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            anyhow::bail!("Invalid log level: {}", self.log_level);
        }

        if let Some(file_path) = &self.log.file_path {
            if file_path.trim().is_empty() {
                anyhow::bail!("Log file path must not be empty");
            }
        }

        Ok(())
    }
}
