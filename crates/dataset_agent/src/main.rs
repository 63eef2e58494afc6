//! Dataset agent service binary.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use agent_runtime::{build_storage, Poller, PollerConfig, ProjectWorker};
use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use database::{PgStore, Store};
use dataset_agent::api::{self, AppState};
use dataset_agent::{DatasetAgentOptions, DatasetWorkflow, KaggleClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// AutoML dataset agent
#[derive(Parser)]
#[command(name = "dataset-agent")]
#[command(about = "Dataset agent: search, download, and stage datasets")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Do not start the poll loop on startup
    #[arg(long)]
    no_poll: bool,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    let port = cli.port.unwrap_or(config.dataset_agent_port);

    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database_url).await?);
    let storage = Arc::new(build_storage(&config)?);

    let username = config
        .kaggle_username
        .clone()
        .context("KAGGLE_USERNAME environment variable not set")?;
    let key = config
        .kaggle_key
        .clone()
        .context("KAGGLE_KEY environment variable not set")?;
    let source = Arc::new(KaggleClient::new(username, key)?);

    let workflow = Arc::new(DatasetWorkflow::new(
        Arc::clone(&store),
        storage,
        source,
        DatasetAgentOptions {
            size_cap_gb: config.max_dataset_size_gb,
            advance_retries: config.advance_status_retries,
        },
    ));

    let poller = Poller::new(
        Arc::clone(&store),
        Arc::clone(&workflow) as Arc<dyn ProjectWorker>,
        PollerConfig {
            poll_interval: config.poll_interval,
            batch_limit: config.dataset_batch_limit,
        },
    );
    if config.auto_poll_on_start && !cli.no_poll {
        poller.start();
    }

    let state = web::Data::new(AppState {
        store,
        workflow,
        poller: poller.clone(),
    });

    info!(host = %config.bind_host, port, "Dataset agent listening");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::configure))
        .bind((config.bind_host.clone(), port))?
        .run()
        .await?;

    poller.stop();
    Ok(())
}
