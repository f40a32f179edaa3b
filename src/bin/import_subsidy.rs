use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use jgrants_sync::config;
use jgrants_sync::db;
use jgrants_sync::enrich::Enricher;
use jgrants_sync::jgrants::JGrantsClient;
use jgrants_sync::sync::{RunOverrides, SyncEngine};
use jgrants_sync::taxonomy;

#[derive(Debug, Parser)]
#[command(author, version, about = "Import a single subsidy by its external id")]
struct Args {
    /// External subsidy id as issued by the source system
    subsidy_id: String,

    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Disable AI enrichment for this import
    #[arg(long)]
    no_ai: bool,

    /// Publish a newly created record instead of saving a draft
    #[arg(long)]
    auto_publish: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/jgrants.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    taxonomy::install_defaults(&pool).await?;

    let source = Arc::new(JGrantsClient::new(
        &cfg.source.base_url,
        Duration::from_secs(cfg.source.timeout_seconds),
    )?);
    let enricher = if cfg.ai.enabled && !args.no_ai {
        Some(Arc::new(Enricher::from_config(&cfg.ai)?))
    } else {
        None
    };
    let engine = SyncEngine::new(pool, source, enricher, cfg);

    let overrides = RunOverrides {
        generate_ai: args.no_ai.then_some(false),
        auto_publish: args.auto_publish.then_some(true),
        ..Default::default()
    };

    let outcome = engine.import_by_id(&args.subsidy_id, &overrides).await?;
    println!(
        "imported subsidy {}: content_id={} status={}",
        args.subsidy_id,
        outcome.content_id(),
        outcome.as_str()
    );
    Ok(())
}
