use anyhow::Result;
use clap::{Parser, Subcommand};

mod client;
mod commands;

#[derive(Parser)]
#[command(name = "ledge", about = "Plugin host for the ledge panel")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the plugin host
    Run(commands::run::RunArgs),
    /// Inspect and reload plugins in a running host
    Plugin(commands::plugin::PluginArgs),
    /// Publish an event onto a running host's bus
    Send(commands::send::SendArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Plugin(args) => commands::plugin::run(args).await,
        Commands::Send(args) => commands::send::run(args).await,
    }
}
