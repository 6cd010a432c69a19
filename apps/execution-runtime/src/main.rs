use anyhow::Result;
use clap::{Parser, Subcommand};
use geotrigger_execution_runtime::config::{Config, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "geotrigger-runtime")]
#[command(about = "Geotrigger execution runtime: reconciliation worker and schema tooling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation worker until Ctrl-C.
    Serve,
    /// Run a single reconciliation pass and log its report.
    Sweep,
    /// Apply the execution schema to DATABASE_URL.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => geotrigger_execution_runtime::serve(config).await,
        Commands::Sweep => {
            let report = geotrigger_execution_runtime::sweep_once(config).await?;
            tracing::info!(
                report = %serde_json::to_string(&report)?,
                errors = report.total_errors(),
                "reconciliation sweep complete"
            );
            Ok(())
        }
        Commands::Migrate => geotrigger_execution_runtime::migrate(config).await,
    }
}
