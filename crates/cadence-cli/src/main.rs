//! Cadence CLI - Command-line interface for cadence container runtimes.

mod commands;
mod runtime;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Cadence container runtime CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a system or container configuration file
    Validate(commands::validate::ValidateArgs),

    /// Compute inter-container buffering for one output
    Negotiate(commands::negotiate::NegotiateArgs),

    /// Run a system of containers and push frames through it
    Simulate(commands::simulate::SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate(args) => commands::validate::run(args),
        Commands::Negotiate(args) => commands::negotiate::run(args),
        Commands::Simulate(args) => commands::simulate::run(args),
    }
}
