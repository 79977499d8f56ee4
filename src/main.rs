//! Remote Runner - run a test suite in a remote runtime, report it locally
//!
//! `serve` starts a controller and drives runs; `client` serves a suite file
//! as a session endpoint.

use clap::Parser;
use commands::Commands;
use remote_runner::{cli, commands, common::logging};

#[derive(Parser)]
#[command(name = "remote-runner", about = "Drive test runs inside a remote runtime")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Client { .. } => {
            if let Some(log_file) = logging::init_endpoint() {
                tracing::debug!(path = %log_file.display(), "Logging to file");
            }
        }
        _ => logging::init_cli(),
    }

    match cli::dispatch(cli.command).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
