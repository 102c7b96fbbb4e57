//! Zapret Host CLI - stands in for the desktop front end
//!
//! Every subcommand prints the resulting State as JSON on stdout.
//! Logs go to stderr (RUST_LOG, default zapret_host=info).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zapret_host::{Service, Settings, State};

#[derive(Parser)]
#[command(name = "zapret-host", version, about = "Manage the local zapret strategy bundle")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the current state
    State,
    /// Download the latest release if it differs from the installed one
    Update,
    /// Run the bundled test harness against every strategy
    Test,
    /// Start a strategy (e.g. "general (ALT).bat"), replacing the running one
    Run { file: String },
    /// Stop the running strategy and any stray winws.exe
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zapret_host=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("Failed to read settings")?;
    info!(base = %settings.base_dir.display(), "zapret host starting");

    let service = Service::new(&settings).context("Failed to create service")?;

    match cli.command {
        Command::State => print_state(&service.state().await.context("Failed to read state")?),
        Command::Update => print_state(
            &service
                .check_and_update()
                .await
                .context("Release update failed")?,
        ),
        Command::Test => {
            let (state, failure) = tokio::select! {
                run = service.run_tests() => run.context("Test run could not start")?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, stopping strategy processes");
                    service.stop_all().await;
                    service
                        .abandon_test_run()
                        .context("Failed to clear the interrupted test run")?;
                    anyhow::bail!("test run interrupted");
                }
            };
            print_state(&state)?;
            if let Some(e) = failure {
                error!("test run finished without results: {}", e);
                return Err(e).context("Test run failed");
            }
            Ok(())
        }
        Command::Run { file } => print_state(
            &service
                .run_strategy(&file)
                .await
                .with_context(|| format!("Failed to start {}", file))?,
        ),
        Command::Stop => {
            service.stop_all().await;
            print_state(&service.state().await.context("Failed to read state")?)
        }
    }
}

fn print_state(state: &State) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
    println!("{}", json);
    Ok(())
}
