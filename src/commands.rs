//! CLI command definitions
//!
//! Defines the clap commands for the remote runner CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Start a controller, wait for an endpoint and run its tests
    Serve {
        /// Address to listen on (default from config: 127.0.0.1:8090)
        #[arg(long, short)]
        listen: Option<String>,

        /// Identity of the endpoint to run
        #[arg(long, default_value = "default")]
        id: String,

        /// Seconds to wait for the endpoint to connect
        #[arg(long)]
        connect_timeout: Option<u64>,

        /// Seconds to wait for a run to finish
        #[arg(long)]
        timeout: Option<u64>,

        /// Number of consecutive runs to request
        #[arg(long, default_value = "1")]
        runs: usize,

        /// Print only the summary, not every test
        #[arg(long, short)]
        quiet: bool,
    },

    /// Run a session endpoint serving a YAML suite file
    Client {
        /// Path to the suite file
        suite: PathBuf,

        /// Controller URL (default from config: ws://localhost:8090)
        #[arg(long)]
        url: Option<String>,

        /// Session identity sent to the controller
        #[arg(long)]
        id: Option<String>,

        /// Delay before reconnecting after an abnormal close
        #[arg(long)]
        retry_delay_ms: Option<u64>,

        /// Do not reconnect after an abnormal close
        #[arg(long)]
        no_retry: bool,
    },

    /// Show the configuration file location and effective settings
    Config,
}
