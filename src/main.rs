use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use shellgate::{
    cli::{Cli, Commands, ConfigAction},
    config::Config,
    init_logging,
    server::{ServerConfig, ShellServer},
    session::{CommandRouter, SessionConfig, ShellSession},
    transport::StdioChannel,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Load configuration before logging so the log file setting applies
    let loaded = Config::load_from_file(&cli.config_file);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => Config::from_env()?,
    };

    // Initialize logging
    let _log_guard = init_logging(
        &cli.effective_log_level(&config.log_level),
        config.log.file_path.as_deref(),
    )?;

    if let Err(err) = &loaded {
        if Path::new(&cli.config_file).exists() {
            tracing::warn!("Failed to load config: {:#}, using defaults", err);
        } else {
            tracing::info!("No config file at {}, using defaults", cli.config_file);
        }
    }
    tracing::debug!("CLI arguments: {:?}", cli);

    match cli.command() {
        Commands::Serve { listen } => serve(config, listen).await,
        Commands::Local => local(config).await,
        Commands::Config { action } => handle_config(&cli, &config, action),
    }
}

async fn serve(config: Config, listen: Option<String>) -> Result<()> {
    let mut server_config = ServerConfig::from(&config);
    if let Some(listen) = listen {
        server_config.listen_addr = listen;
    }

    let router = Arc::new(CommandRouter::with_builtins());
    let server = ShellServer::bind(server_config, router).await?;

    println!(
        "{} {}",
        "shellgate listening on".green().bold(),
        server.local_addr()?.to_string().cyan()
    );

    spawn_ctrl_c(server.shutdown_token());
    server.run().await?;

    Ok(())
}

async fn local(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let session = ShellSession::new(
        0,
        StdioChannel::new(),
        Arc::new(CommandRouter::with_builtins()),
        SessionConfig::from(&config),
        cancel,
    );

    let report = session.run().await?;
    tracing::info!("Local session ended: {:?}", report.outcome);

    Ok(())
}

fn handle_config(cli: &Cli, config: &Config, action: Option<ConfigAction>) -> Result<()> {
    match action {
        Some(ConfigAction::Show) | None => {
            println!("{}", format!("Configuration ({})", cli.config_file).bold());
            print!("{}", config.to_toml()?);
        }
        Some(ConfigAction::Path) => {
            let path = Config::resolve_path(&cli.config_file)?;
            let status = if path.exists() {
                "exists".green()
            } else {
                "not found".yellow()
            };
            println!("{} ({})", path.display(), status);
        }
        Some(ConfigAction::Init) => {
            if Path::new(&cli.config_file).exists() {
                anyhow::bail!("Config file already exists: {}", cli.config_file);
            }
            Config::default().save_to_file(&cli.config_file)?;
            println!("{} {}", "Wrote default configuration to".green(), cli.config_file);
        }
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C. Sessions blocked on a read only notice once
/// the read returns.
fn spawn_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            token.cancel();
        }
    });
}
