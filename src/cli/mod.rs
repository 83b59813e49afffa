//! Command Line Interface module
//!
//! Implements the process-level commands and argument parsing for Shellgate.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "shellgate")]
#[command(about = "Interactive command shell over duplex streams")]
#[command(long_about = "Serves a line-oriented command shell, one session per connection")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    #[arg(long, default_value = "shellgate.toml")]
    pub config_file: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept TCP connections and serve one session per connection
    Serve {
        /// Listen address, overrides the configuration
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run a single session on this process's stdin/stdout
    Local,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Serve { listen: None }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Print the resolved config file path
    Path,

    /// Write the default configuration to the config file
    Init,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the actual command, using default if none provided
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or_default()
    }

    /// Resolve the log level from the verbose flag, the CLI and the config
    pub fn effective_log_level(&self, configured: &str) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| configured.to_string())
        }
    }
}
