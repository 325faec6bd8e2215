//! OrchFlow CLI entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use orchflow::infrastructure::{config::ConfigLoader, logging, server};
use orchflow::services::OrchflowRuntime;

#[derive(Parser)]
#[command(name = "orchflow", version, about = "Orchestration engine for worker pools")]
struct Cli {
    /// Path to a configuration file (defaults to .orchflow/config.yaml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime and the tool-call server
    Serve {
        /// Override the bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load().context("Failed to load configuration")?,
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Serve { host, port } => {
            let _log_guard = logging::init(&config.logging);

            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);

            let runtime = OrchflowRuntime::new(config)
                .await
                .context("Failed to build runtime")?;
            runtime.start().await.context("Failed to start runtime")?;

            let serve_runtime = runtime.clone();
            let result = tokio::select! {
                served = server::serve(serve_runtime, &host, port) => {
                    served.context("Tool-call server failed")
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                    Ok(())
                }
            };

            runtime.shutdown().await;
            result
        }
    }
}
