use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Which object store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local filesystem rooted at `storage_base_path`.
    Local,
    /// In-memory store, for tests and throwaway environments.
    Memory,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Object store backend (`local` or `memory`)
    pub storage_backend: StorageBackend,

    /// Bucket name artifacts are written under
    pub storage_bucket: String,

    /// Buckets object URIs are allowed to reference
    pub allowed_buckets: Vec<String>,

    /// Base directory for the local object store backend
    pub storage_base_path: PathBuf,

    /// Gemini API key for the planner LLM
    pub gemini_api_key: Option<String>,

    /// Planner LLM model id
    pub planner_llm_model: String,

    /// Kaggle API credentials for the dataset source
    pub kaggle_username: Option<String>,
    pub kaggle_key: Option<String>,

    /// Seconds between poll ticks
    pub poll_interval: Duration,

    /// Projects claimed per tick by the dataset agent
    pub dataset_batch_limit: i64,

    /// Projects claimed per tick by the training poller
    pub training_batch_limit: i64,

    /// Projects claimed per tick by the evaluation poller
    pub evaluation_batch_limit: i64,

    /// Hard ceiling on dataset size, above whatever the plan requests
    pub max_dataset_size_gb: f64,

    /// Data loader batch size
    pub batch_size: usize,

    /// Training epochs when the plan omits them
    pub default_epochs: usize,

    /// Optimizer learning rate when the plan omits it
    pub default_learning_rate: f64,

    /// Object store retry budgets
    pub download_retries: usize,
    pub upload_retries: usize,

    /// Retries for the conditional status update
    pub advance_status_retries: usize,

    /// Deadline for a single long-running workflow step
    pub step_timeout: Duration,

    /// Object path prefix holding pretrained feature-extractor records
    pub pretrained_weights_prefix: Option<String>,

    /// Whether pollers start automatically on service startup
    pub auto_poll_on_start: bool,

    /// Service bind host
    pub bind_host: String,

    /// Per-service ports
    pub gateway_port: u16,
    pub planner_port: u16,
    pub dataset_agent_port: u16,
    pub trainer_agent_port: u16,

    /// Upstream service URLs used by the gateway
    pub planner_agent_url: String,
    pub trainer_agent_url: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `DATABASE_URL`: `PostgreSQL` connection string
    ///
    /// Optional environment variables (defaults in parentheses):
    /// - `STORAGE_BACKEND`: `local` or `memory` (`local`)
    /// - `STORAGE_BUCKET`: bucket artifacts live under (`automl-artifacts`)
    /// - `ALLOWED_BUCKETS`: comma-separated allow-list (the bucket itself)
    /// - `STORAGE_BASE_PATH`: root for the local backend (`/workspace/automl`)
    /// - `GEMINI_API_KEY`, `PLANNER_LLM_MODEL` (`gemini-2.5-flash`)
    /// - `KAGGLE_USERNAME`, `KAGGLE_KEY`
    /// - `POLL_INTERVAL_SECONDS` (10), `DATASET_BATCH_LIMIT` (4),
    ///   `TRAINING_BATCH_LIMIT` (1), `EVALUATION_BATCH_LIMIT` (4)
    /// - `MAX_DATASET_SIZE_GB` (50), `BATCH_SIZE` (32),
    ///   `DEFAULT_EPOCHS` (10), `DEFAULT_LEARNING_RATE` (0.001)
    /// - `DOWNLOAD_RETRIES` (5), `UPLOAD_RETRIES` (5),
    ///   `ADVANCE_STATUS_RETRIES` (3), `STEP_TIMEOUT_SECONDS` (3600)
    /// - `PRETRAINED_WEIGHTS_PREFIX`
    /// - `AUTO_POLL_ON_START` (true)
    /// - `BIND_HOST` (0.0.0.0), `GATEWAY_PORT` (8000), `PLANNER_PORT` (8001),
    ///   `DATASET_AGENT_PORT` (8002), `TRAINER_AGENT_PORT` (8003)
    /// - `PLANNER_AGENT_URL` (http://127.0.0.1:8001),
    ///   `TRAINER_AGENT_URL` (http://127.0.0.1:8003)
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value fails to
    /// parse.
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let storage_backend = match var_or("STORAGE_BACKEND", "local").to_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            _ => StorageBackend::Local,
        };

        let storage_bucket = var_or("STORAGE_BUCKET", "automl-artifacts");
        let allowed_buckets = std::env::var("ALLOWED_BUCKETS")
            .map(|v| {
                v.split(',')
                    .map(|b| b.trim().to_string())
                    .filter(|b| !b.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| vec![storage_bucket.clone()]);

        Ok(Self {
            database_url,
            storage_backend,
            storage_bucket,
            allowed_buckets,
            storage_base_path: std::env::var("STORAGE_BASE_PATH")
                .map_or_else(|_| PathBuf::from("/workspace/automl"), PathBuf::from),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            planner_llm_model: var_or("PLANNER_LLM_MODEL", "gemini-2.5-flash"),
            kaggle_username: std::env::var("KAGGLE_USERNAME").ok(),
            kaggle_key: std::env::var("KAGGLE_KEY").ok(),
            poll_interval: Duration::from_secs(parsed_var("POLL_INTERVAL_SECONDS", 10)?),
            dataset_batch_limit: parsed_var("DATASET_BATCH_LIMIT", 4)?,
            training_batch_limit: parsed_var("TRAINING_BATCH_LIMIT", 1)?,
            evaluation_batch_limit: parsed_var("EVALUATION_BATCH_LIMIT", 4)?,
            max_dataset_size_gb: parsed_var("MAX_DATASET_SIZE_GB", 50.0)?,
            batch_size: parsed_var("BATCH_SIZE", 32)?,
            default_epochs: parsed_var("DEFAULT_EPOCHS", 10)?,
            default_learning_rate: parsed_var("DEFAULT_LEARNING_RATE", 0.001)?,
            download_retries: parsed_var("DOWNLOAD_RETRIES", 5)?,
            upload_retries: parsed_var("UPLOAD_RETRIES", 5)?,
            advance_status_retries: parsed_var("ADVANCE_STATUS_RETRIES", 3)?,
            step_timeout: Duration::from_secs(parsed_var("STEP_TIMEOUT_SECONDS", 3600)?),
            pretrained_weights_prefix: std::env::var("PRETRAINED_WEIGHTS_PREFIX").ok(),
            auto_poll_on_start: parsed_var("AUTO_POLL_ON_START", true)?,
            bind_host: var_or("BIND_HOST", "0.0.0.0"),
            gateway_port: parsed_var("GATEWAY_PORT", 8000)?,
            planner_port: parsed_var("PLANNER_PORT", 8001)?,
            dataset_agent_port: parsed_var("DATASET_AGENT_PORT", 8002)?,
            trainer_agent_port: parsed_var("TRAINER_AGENT_PORT", 8003)?,
            planner_agent_url: var_or("PLANNER_AGENT_URL", "http://127.0.0.1:8001"),
            trainer_agent_url: var_or("TRAINER_AGENT_URL", "http://127.0.0.1:8003"),
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}
