mod azure;
mod cli;
mod duration;
mod error;
mod filter;
mod inventory;
mod models;
mod orchestrator;
mod output;
mod registry;
mod safety;
mod shell;

use std::process;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use azure::AzureCli;
use cli::{Backend, Cli, Settings};
use error::AppError;
use inventory::Kubectl;
use orchestrator::{Orchestrator, Outcome};
use registry::{AccountSwitcher, DeletionExecutor, ManifestSource, RegistryClient};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<AppError>() {
            Some(app) => {
                eprintln!("Error [{}]: {:#}", app.kind(), e);
                if app.is_parse_error() || matches!(app, AppError::Config(_)) {
                    eprintln!("Nothing was queried or deleted.");
                }
            }
            None => eprintln!("Error: {:#}", e),
        }
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Parse everything before the first external call
    let settings = cli.into_settings(Utc::now())?;

    match settings.backend {
        Backend::Azure => {
            let az = AzureCli::new(&settings.registry);
            if let Some(subscription) = &settings.subscription {
                info!("Switching to subscription {}", subscription);
                az.switch_account(subscription).await?;
            }
            sweep(&settings, &az, &az).await
        }
        Backend::RegistryV2 => {
            let client = RegistryClient::new(&settings.registry);
            sweep(&settings, &client, &client).await
        }
    }
}

async fn sweep(
    settings: &Settings,
    source: &dyn ManifestSource,
    executor: &dyn DeletionExecutor,
) -> Result<()> {
    let inventory = match inventory::resolve_contexts(&Kubectl, &settings.contexts).await? {
        Some(contexts) => Some(inventory::collect(&Kubectl, &contexts).await),
        None => None,
    };

    info!(
        "Looking for images in {} last updated before {}",
        settings.run.repository,
        settings.run.window.query_timestamp()
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let mut orchestrator = Orchestrator::new(&settings.run, source, executor);
    let outcome = orchestrator.run(inventory.as_ref(), stdin).await;
    debug!("Run finished in state {:?}", orchestrator.state());
    match outcome? {
        Outcome::NothingToDelete | Outcome::Declined => {}
        Outcome::Completed(summary) if summary.failed > 0 => {
            info!("{} deletions failed, see the errors above", summary.failed);
        }
        Outcome::Completed(_) => {}
    }

    Ok(())
}
