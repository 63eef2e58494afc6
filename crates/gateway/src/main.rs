//! Gateway service binary.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use agent_runtime::build_storage;
use anyhow::Result;
use clap::Parser;
use config::Config;
use database::{PgStore, Store};
use gateway::api;
use gateway::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// AutoML orchestrator gateway
#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Public REST facade for the AutoML orchestrator")]
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
    let port = cli.port.unwrap_or(config.gateway_port);

    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database_url).await?);
    let storage = Arc::new(build_storage(&config)?);

    let state = web::Data::new(AppState {
        store,
        storage,
        http: reqwest::Client::new(),
        planner_url: config.planner_agent_url.clone(),
        trainer_url: config.trainer_agent_url.clone(),
    });

    info!(host = %config.bind_host, port, "Gateway listening");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec!["Content-Type", "Authorization"])
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .wrap(cors)
            .configure(api::configure)
    })
    .bind((config.bind_host.clone(), port))?
    .run()
    .await?;

    Ok(())
}
