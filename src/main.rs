use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use jgrants_sync::config;
use jgrants_sync::db;
use jgrants_sync::enrich::Enricher;
use jgrants_sync::jgrants::JGrantsClient;
use jgrants_sync::scheduler::Scheduler;
use jgrants_sync::sync::{RunOverrides, SyncEngine, SyncError};
use jgrants_sync::taxonomy;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let enricher = if cfg.ai.enabled {
        Some(Arc::new(Enricher::from_config(&cfg.ai)?))
    } else {
        None
    };
    let engine = Arc::new(SyncEngine::new(pool, source, enricher, cfg.clone()));

    let mut scheduler = Scheduler::new();

    {
        let engine = engine.clone();
        scheduler.register_interval(
            "sync",
            Duration::from_secs(cfg.sync.interval_hours * 3600),
            move || {
                let engine = engine.clone();
                async move {
                    match engine.run_sync(&RunOverrides::default()).await {
                        Ok(stats) => info!(
                            fetched = stats.fetched,
                            created = stats.created,
                            updated = stats.updated,
                            "scheduled sync finished"
                        ),
                        Err(SyncError::AlreadyRunning) => {
                            warn!("scheduled sync skipped; another run is in progress")
                        }
                        Err(err) => error!(?err, "scheduled sync failed"),
                    }
                }
            },
        );
    }

    {
        let engine = engine.clone();
        scheduler.register_interval(
            "deadline-sweep",
            Duration::from_secs(24 * 3600),
            move || {
                let engine = engine.clone();
                async move {
                    if let Err(err) = engine.check_deadlines().await {
                        error!(?err, "deadline sweep failed");
                    }
                }
            },
        );
    }

    {
        let engine = engine.clone();
        let cleanup_days = cfg.sync.cleanup_days;
        scheduler.register_interval(
            "retention-sweep",
            Duration::from_secs(7 * 24 * 3600),
            move || {
                let engine = engine.clone();
                async move {
                    if let Err(err) = engine.cleanup_expired(cleanup_days).await {
                        error!(?err, "retention sweep failed");
                    }
                }
            },
        );
    }

    info!(
        interval_hours = cfg.sync.interval_hours,
        "scheduler started; waiting for Ctrl-C"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler.shutdown();

    Ok(())
}
