use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use thiserror::Error;

use imaging_orchestrator::config::{self, ConfigError};
use imaging_orchestrator::models::patient_input_from_text;
use imaging_orchestrator::pipeline::catalog::{
    enrich_catalog, load_catalog_entries, CatalogError, CatalogHandle, NoLiterature,
};
use imaging_orchestrator::pipeline::generation::missing_models;
use imaging_orchestrator::pipeline::{
    CancelHandle, GenerationError, OllamaClient, PipelineController, PipelineError, RateLimiter,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Imaging protocol selection with confidence-gated safety review", long_about = None)]
struct Cli {
    /// Patient record: JSON object, CSV header plus one value line, or free text.
    #[clap(long, short = 'p', value_name = "FILE")]
    patient: PathBuf,

    /// Protocol catalog (JSON array or {"entries": [...]}).
    #[clap(long, short = 'c', value_name = "FILE")]
    catalog: PathBuf,

    /// Pipeline configuration. Defaults to ~/.imaging-orchestrator/config.json when present.
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the report here instead of stdout.
    #[clap(long, short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Evaluate lab staleness at this RFC 3339 instant instead of now.
    #[clap(long, value_name = "TIMESTAMP")]
    as_of: Option<DateTime<Utc>>,

    /// Skip checking that the configured models are installed.
    #[clap(long)]
    skip_preflight: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Models not installed on the generation service: {0}")]
    MissingModels(String),

    #[error("Cannot write report: {0}")]
    Write(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    imaging_orchestrator::init_tracing();
    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        // Finished, but a human has to look at it.
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!(error = %e, "Run did not complete");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the run was accepted without human review.
async fn run(cli: Cli) -> Result<bool, CliError> {
    let config = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };

    let client = OllamaClient::from_config(&config.generation, config.external.call_timeout())?;
    if !cli.skip_preflight {
        let installed = client.list_models().await?;
        let generation = &config.generation;
        let mut required = vec![
            generation.selection_model.as_str(),
            generation.review_model.as_str(),
            generation.embedding_model.as_str(),
        ];
        required.extend(generation.scoring_model.as_deref());
        let missing = missing_models(&installed, &required);
        if !missing.is_empty() {
            return Err(CliError::MissingModels(missing.join(", ")));
        }
        tracing::debug!(installed = installed.len(), "Model preflight passed");
    }

    let entries = load_catalog_entries(&cli.catalog)?;
    let catalog = enrich_catalog(entries, &client, &NoLiterature, config.matcher.max_snippets).await?;
    let catalog = CatalogHandle::new(catalog);

    let patient = read_patient(&cli.patient)?;

    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    // Generation and embeddings come from the same service.
    let embedder = OllamaClient::from_config(&config.generation, config.external.call_timeout())?;
    let controller = PipelineController::new(config, client, embedder, limiter, catalog)?;

    let (cancel, token) = CancelHandle::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let as_of = cli.as_of.unwrap_or_else(Utc::now);
    let run = controller.run_at(&patient, as_of, &token).await?;
    let report = run.report();

    let json = serde_json::to_string_pretty(&report).map_err(|e| CliError::Write(e.to_string()))?;
    match &cli.output {
        Some(path) => {
            std::fs::write(path, json).map_err(|e| CliError::Write(e.to_string()))?;
            tracing::info!(path = %path.display(), "Report written");
        }
        None => println!("{json}"),
    }

    Ok(!report.requires_human_review)
}

fn read_patient(path: &Path) -> Result<serde_json::Value, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(patient_input_from_text(&raw))
}
