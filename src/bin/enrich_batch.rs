use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use jgrants_sync::config;
use jgrants_sync::db;
use jgrants_sync::enrich::Enricher;

#[derive(Debug, Parser)]
#[command(author, version, about = "Batch-enrich a list of content ids with AI text")]
struct Args {
    /// Content ids to enrich, in order
    #[arg(required = true)]
    content_ids: Vec<i64>,

    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Items per group; defaults to ai.batch_size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seconds to pause between items; defaults to ai.batch_delay_seconds
    #[arg(long)]
    delay: Option<u64>,
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
    if !cfg.ai.enabled {
        bail!("ai.enabled is false; nothing to do");
    }

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/jgrants.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let enricher = Enricher::from_config(&cfg.ai)?;
    let batch_size = args.batch_size.unwrap_or(cfg.ai.batch_size);
    let delay = args.delay.unwrap_or(cfg.ai.batch_delay_seconds);

    let outcome = enricher
        .batch_enrich(&pool, &args.content_ids, batch_size, delay)
        .await;
    println!(
        "enriched {} items: {} succeeded, {} failed, {} skipped",
        args.content_ids.len(),
        outcome.success,
        outcome.failed,
        outcome.skipped
    );
    Ok(())
}
