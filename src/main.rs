use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use payflow::config::EngineConfig;
use payflow::interfaces::scenario::{ScenarioReader, run_scenario};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted payment scenario and print the final snapshot as JSON
    Simulate {
        /// Scenario JSON file
        scenario: PathBuf,

        /// Engine configuration JSON file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse and validate an engine configuration file
    ValidateConfig {
        /// Engine configuration JSON file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("payflow=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Simulate { scenario, config } => {
            let config = match config {
                Some(path) => EngineConfig::from_path(path).into_diagnostic()?,
                None => EngineConfig::default(),
            };
            let file = File::open(scenario).into_diagnostic()?;
            let scenario = ScenarioReader::new(file).read().into_diagnostic()?;
            let report = run_scenario(scenario, &config).await.into_diagnostic()?;

            let stdout = io::stdout();
            serde_json::to_writer_pretty(stdout.lock(), &report).into_diagnostic()?;
            println!();
        }
        Commands::ValidateConfig { config } => {
            let config = EngineConfig::from_path(config).into_diagnostic()?;
            println!("{}", serde_json::to_string_pretty(&config).into_diagnostic()?);
        }
    }

    Ok(())
}
