mod cli;
mod config;
mod error;
mod extract;
mod model;
mod pipeline;
mod providers;
mod tools;
mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands};
use config::Settings;
use extract::customer::CustomerCatalog;
use pipeline::dispatch::Dispatcher;
use pipeline::monitor::Monitor;
use pipeline::store::ProcessedStore;
use providers::azure_devops::AzureDevOpsClient;
use providers::github::GitHubActionsClient;

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

/// Logs go to stderr; stdout belongs to command output and the tool server.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ado_trigger=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::load_config(cli.config.as_deref())?.resolve()?;
    let dispatcher = build_dispatcher(&settings)?;

    match cli.command() {
        Commands::Monitor => {
            dispatcher.startup_check().await?;
            let mut store = ProcessedStore::load(settings.monitor.state_file.clone())?;
            let summary = Monitor::new(&dispatcher, &settings.monitor)
                .run(&mut store, shutdown_token())
                .await?;
            tracing::info!(cycles = summary.cycles, stop = ?summary.stop, "exiting");
        }
        Commands::Cycle => {
            dispatcher.startup_check().await?;
            let mut store = ProcessedStore::load(settings.monitor.state_file.clone())?;
            let report = dispatcher.run_cycle(&mut store).await;
            store.persist();
            cli::print_json(&report?)?;
        }
        Commands::Items => cli::handle_items(&dispatcher).await?,
        Commands::Inspect { id } => cli::handle_inspect(&dispatcher, id).await?,
        Commands::Runs { limit } => cli::handle_runs(&dispatcher, limit).await?,
        Commands::Serve => {
            let store = ProcessedStore::load(settings.monitor.state_file.clone())?;
            let mut server = tools::ToolServer::new(dispatcher, store);
            tracing::info!("tool server reading requests from stdin");
            tools::serve(
                &mut server,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
                shutdown_token(),
            )
            .await?;
        }
    }
    Ok(())
}

fn build_dispatcher(settings: &Settings) -> Result<Dispatcher> {
    let work = AzureDevOpsClient::new(&settings.azure).context("Failed to build Azure DevOps client")?;
    let ci = GitHubActionsClient::new(&settings.github).context("Failed to build GitHub client")?;
    let catalog = CustomerCatalog::discover(&settings.customers);
    Ok(Dispatcher::new(Arc::new(work), Arc::new(ci), catalog, settings))
}

/// Cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested, finishing current cycle");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
