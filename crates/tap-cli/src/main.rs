use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tap_pipeline::{
    ingestion_spec, run_ingestion, run_scoring, scoring_spec, seed_from_config, AppConfig,
    IngestionJob, JobContext, ScoringJob,
};
use tap_sched::Scheduler;
use tap_store::{MemoryStore, Store};
use tap_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "tap-cli")]
#[command(about = "Tender acquisition pipeline daemon and one-shot tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run,
    Ingest,
    Score,
    Jobs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Ingest => ingest_once(config).await,
        Commands::Score => score_once(config).await,
        Commands::Jobs => show_jobs(config).await,
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    seed_from_config(&config, store.as_ref()).await?;

    let ctx = JobContext::from_config(&config, store.clone())?;
    let scheduler = Scheduler::new(store.clone(), Arc::new(ctx), config.max_consecutive_failures);
    scheduler
        .register(ingestion_spec(&config), IngestionJob)
        .await?;
    scheduler
        .register(scoring_spec(&config), ScoringJob)
        .await?;
    scheduler.start_all().await?;

    let state = AppState::new(Arc::new(scheduler.clone()), store);
    let port = config.web_port;
    let mut web = tokio::spawn(tap_web::serve(state, port));
    info!(port, "daemon ready; press ctrl-c to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        joined = &mut web => {
            scheduler.shutdown().await;
            return joined?;
        }
    }

    scheduler.shutdown().await;
    web.abort();
    Ok(())
}

async fn ingest_once(config: AppConfig) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    seed_from_config(&config, store.as_ref()).await?;
    let ctx = JobContext::from_config(&config, store)?;

    let report = run_ingestion(&ctx, Uuid::new_v4()).await?;
    for err in &report.errors {
        eprintln!("warning: {err}");
    }
    println!(
        "ingestion complete: run_id={} {}",
        report.run_id,
        report.summary_line()
    );
    Ok(())
}

async fn score_once(config: AppConfig) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    seed_from_config(&config, store.as_ref()).await?;
    let ctx = JobContext::from_config(&config, store)?;

    let report = run_scoring(&ctx, Uuid::new_v4()).await?;
    for err in &report.errors {
        eprintln!("warning: {err}");
    }
    println!(
        "scoring complete: run_id={} {}",
        report.run_id,
        report.summary_line()
    );
    Ok(())
}

async fn show_jobs(config: AppConfig) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let ctx = JobContext::from_config(&config, store.clone())?;
    let scheduler = Scheduler::new(store, Arc::new(ctx), config.max_consecutive_failures);
    scheduler
        .register(ingestion_spec(&config), IngestionJob)
        .await?;
    scheduler
        .register(scoring_spec(&config), ScoringJob)
        .await?;

    for status in scheduler.status_all().await? {
        println!(
            "{:<20} {:<28} active={} timeout={}s runs={} errors={}",
            status.name,
            status.recurrence,
            status.active,
            status.timeout_secs,
            status.run_count,
            status.error_count
        );
    }
    Ok(())
}
