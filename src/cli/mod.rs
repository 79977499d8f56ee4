//! CLI command handling
//!
//! Runs the controller or a session endpoint and formats output.

mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;

use crate::commands::Commands;
use crate::common::{config::Config, paths, Result};
use crate::controller::Controller;
use crate::endpoint::{Callbacks, Client};
use crate::framework::suite_file::SuiteSpec;
use crate::framework::{FrameworkFactory, TestFramework};

use report::SpecReporter;

/// Dispatch a CLI command, returning the process exit code
pub async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Serve {
            listen,
            id,
            connect_timeout,
            timeout,
            runs,
            quiet,
        } => {
            let config = Config::load()?;
            let listen = listen.unwrap_or_else(|| config.controller.listen.clone());
            let connect_timeout = Duration::from_secs(
                connect_timeout.unwrap_or(config.controller.connect_timeout_secs),
            );
            let run_timeout =
                Duration::from_secs(timeout.unwrap_or(config.controller.run_timeout_secs));

            serve(&listen, &id, connect_timeout, run_timeout, runs, quiet).await
        }

        Commands::Client {
            suite,
            url,
            id,
            retry_delay_ms,
            no_retry,
        } => client(&suite, url, id, retry_delay_ms, no_retry).await,

        Commands::Config => {
            let config = Config::load()?;
            match paths::config_path() {
                Some(path) if path.exists() => println!("Config file: {}", path.display()),
                Some(path) => println!("Config file: {} (not found, using defaults)", path.display()),
                None => println!("Config file: unavailable on this platform"),
            }
            println!();
            println!("[client]");
            println!("  url            = {}", config.client.url);
            println!("  id             = {}", config.client.id);
            println!("  auto_connect   = {}", config.client.auto_connect);
            println!("  auto_retry     = {}", config.client.auto_retry);
            println!("  retry_delay_ms = {}", config.client.retry_delay_ms);
            println!("[controller]");
            println!("  listen               = {}", config.controller.listen);
            println!(
                "  connect_timeout_secs = {}",
                config.controller.connect_timeout_secs
            );
            println!("  run_timeout_secs     = {}", config.controller.run_timeout_secs);
            Ok(0)
        }
    }
}

async fn serve(
    listen: &str,
    identity: &str,
    connect_timeout: Duration,
    run_timeout: Duration,
    runs: usize,
    quiet: bool,
) -> Result<i32> {
    let mut controller = Controller::bind(listen).await?;
    println!("Listening on {}", controller.url());
    println!("Waiting for endpoint '{}'...", identity);

    let connection = controller
        .wait_for_connection(identity, connect_timeout)
        .await?;
    println!("{} Endpoint '{}' connected", "✓".green(), identity);

    let mut failed_runs = 0;
    for run in 1..=runs {
        if runs > 1 {
            println!();
            println!("{}", format!("Run {}/{}", run, runs).bold());
        }
        println!();

        controller.request_run(connection)?;
        let mut reporter = SpecReporter::new(quiet);
        let summary = controller
            .run_to_completion(connection, run_timeout, |event| reporter.event(event))
            .await?;
        reporter.summary(&summary);

        if !summary.passed() {
            failed_runs += 1;
        }
    }

    controller.shutdown();
    Ok(if failed_runs > 0 { 1 } else { 0 })
}

async fn client(
    suite: &Path,
    url: Option<String>,
    id: Option<String>,
    retry_delay_ms: Option<u64>,
    no_retry: bool,
) -> Result<i32> {
    let config = Config::load()?;
    let spec = Arc::new(SuiteSpec::load(suite)?);

    let mut client_config = config.client_config();
    if let Some(url) = url {
        client_config.url = url;
    }
    if let Some(id) = id {
        client_config.id = id;
    }
    if let Some(delay) = retry_delay_ms {
        client_config.retry_delay = Duration::from_millis(delay);
    }
    if no_retry {
        client_config.auto_retry = false;
    }

    let factory: FrameworkFactory = Arc::new(move |_options| {
        Ok(Box::new(spec.framework()) as Box<dyn TestFramework>)
    });

    let suite_name = display_name(suite);
    let callbacks = Callbacks::default()
        .on_connected(|| println!("{} Connected to controller", "✓".green()))
        .on_disconnected(|close| println!("{} Disconnected ({})", "✗".red(), close))
        .on_running(move |run| {
            println!("Run {} of {} started", run.id(), suite_name);
            let mut run = run.clone();
            tokio::spawn(async move {
                let failures = run.completed().await;
                if failures == 0 {
                    println!("{} Run {} passed", "✓".green(), run.id());
                } else {
                    println!("{} Run {} had {} failure(s)", "✗".red(), run.id(), failures);
                }
            });
        });

    let client = Client::new(client_config, callbacks, factory)?;
    if !client.config().auto_connect {
        client.connect()?;
    }
    println!(
        "Serving {} as '{}' to {} (Ctrl-C to stop)",
        display_name(suite),
        client.identity(),
        client.config().url
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C, shutting down");
    client.disconnect();
    Ok(0)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}
