//! Trainer service binary (training + evaluation agents).

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use agent_runtime::{build_storage, Poller, PollerConfig, ProjectWorker};
use anyhow::Result;
use clap::Parser;
use config::Config;
use database::{PgStore, Store};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trainer_agent::api::{self, AppState};
use trainer_agent::{
    EvaluationWorkflow, EvaluatorOptions, PredictService, TrainerOptions, TrainingWorkflow,
};

/// AutoML trainer service
#[derive(Parser)]
#[command(name = "trainer-agent")]
#[command(about = "Training and evaluation agents for AutoML projects")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Do not start the poll loops on startup
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
    let port = cli.port.unwrap_or(config.trainer_agent_port);

    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database_url).await?);
    let storage = Arc::new(build_storage(&config)?);

    let training = Arc::new(TrainingWorkflow::new(
        Arc::clone(&store),
        Arc::clone(&storage),
        TrainerOptions {
            batch_size: config.batch_size,
            default_epochs: config.default_epochs,
            default_learning_rate: config.default_learning_rate,
            advance_retries: config.advance_status_retries,
            step_timeout: config.step_timeout,
            pretrained_prefix: config.pretrained_weights_prefix.clone(),
            ..TrainerOptions::default()
        },
    ));

    let evaluation = Arc::new(EvaluationWorkflow::new(
        Arc::clone(&store),
        Arc::clone(&storage),
        EvaluatorOptions {
            batch_size: config.batch_size,
            advance_retries: config.advance_status_retries,
            step_timeout: config.step_timeout,
            ..EvaluatorOptions::default()
        },
    ));

    // One training at a time; evaluation can take a small batch per tick.
    let training_poller = Poller::new(
        Arc::clone(&store),
        Arc::clone(&training) as Arc<dyn ProjectWorker>,
        PollerConfig {
            poll_interval: config.poll_interval,
            batch_limit: config.training_batch_limit,
        },
    );
    let evaluation_poller = Poller::new(
        Arc::clone(&store),
        Arc::clone(&evaluation) as Arc<dyn ProjectWorker>,
        PollerConfig {
            poll_interval: config.poll_interval,
            batch_limit: config.evaluation_batch_limit,
        },
    );

    if config.auto_poll_on_start && !cli.no_poll {
        training_poller.start();
        evaluation_poller.start();
    }

    let predictor = PredictService::new(Arc::clone(&store), Arc::clone(&storage), 224);

    let state = web::Data::new(AppState {
        store,
        training,
        evaluation,
        training_poller: training_poller.clone(),
        evaluation_poller: evaluation_poller.clone(),
        predictor,
    });

    info!(host = %config.bind_host, port, "Trainer service listening");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::configure))
        .bind((config.bind_host.clone(), port))?
        .run()
        .await?;

    training_poller.stop();
    evaluation_poller.stop();
    Ok(())
}
