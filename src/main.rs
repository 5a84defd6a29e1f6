use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use codemend::config::AppConfig;
use codemend::server::{self, App};

#[derive(Parser)]
#[command(
    name = "codemend",
    about = "Automated code-quality remediation orchestrator",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "codemend.toml", env = "CODEMEND_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server plus the periodic sweep scheduler.
    Serve,
    /// Run one sweep pass immediately and wait for the started runs.
    Sweep,
    /// Re-drive runs left in `running` by a previous process.
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Serve => server::start_server(config).await,
        Commands::Sweep => run_sweep_once(config).await,
        Commands::Resume => {
            let app = App::build(config)?;
            let resumed = app.orchestrator.resume_and_wait().await?;
            println!("Resumed {} run(s).", resumed);
            Ok(())
        }
    }
}

async fn run_sweep_once(config: AppConfig) -> Result<()> {
    let app = App::build(config)?;
    let report = app.scanner.run_pass().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    // Started workflows run on spawned tasks; hold the process open until
    // every run reaches a terminal state.
    loop {
        let remaining = app.db.call(|store| store.list_running_runs()).await?.len();
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    Ok(())
}
