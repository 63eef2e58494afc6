//! Planner agent service binary.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use database::PgStore;
use planner::api::{self, AppState};
use planner::{GeminiModel, PlannerService};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// AutoML planner agent
#[derive(Parser)]
#[command(name = "planner-agent")]
#[command(about = "Planner agent: user intent to validated project plans")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,
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
    let port = cli.port.unwrap_or(config.planner_port);

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    let api_key = config
        .gemini_api_key
        .clone()
        .context("GEMINI_API_KEY environment variable not set")?;
    let model = Arc::new(GeminiModel::new(config.planner_llm_model.clone(), api_key));

    let state = web::Data::new(AppState {
        service: PlannerService::new(store, model),
    });

    info!(host = %config.bind_host, port, "Planner agent listening");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::configure))
        .bind((config.bind_host.clone(), port))?
        .run()
        .await?;

    Ok(())
}
