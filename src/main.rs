mod cli;
mod server;
mod tools;

use anyhow::Result;
use clap::{Parser, Subcommand};
use continuum::config::ContinuumConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "continuum", version, about = "Context continuity engine for AI coding sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (stdio transport unless --http)
    Serve {
        /// Serve Streamable HTTP on the configured host and port
        #[arg(long)]
        http: bool,
    },
    /// List a user's session cursors
    Cursors {
        /// User whose cursors to list
        user: String,
    },
    /// Push every due queued event to the graph store once
    Flush,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first: it carries the log level.
    let config = ContinuumConfig::load()?;

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { http } => {
            if http || config.server.transport == "http" {
                server::serve_http(config).await?;
            } else {
                server::serve_stdio(config).await?;
            }
        }
        Command::Cursors { user } => cli::cursors::cursors(config, &user)?,
        Command::Flush => cli::flush::flush(config).await?,
    }

    Ok(())
}
