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
#[command(
    author,
    version,
    about = "Run one sync against the subsidy API with ad hoc search parameters"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Search keyword (min 2 characters); defaults to the configured keyword
    #[arg(long)]
    keyword: Option<String>,

    /// Maximum number of subsidies to import
    #[arg(long)]
    count: Option<usize>,

    /// Acceptance filter: 1 = currently accepting, 0 = all
    #[arg(long)]
    acceptance: Option<String>,

    /// Disable AI enrichment for this run
    #[arg(long)]
    no_ai: bool,

    /// Publish newly created records instead of saving drafts
    #[arg(long)]
    auto_publish: bool,

    /// Rewrite existing bodies even when non-empty
    #[arg(long)]
    force_body: bool,

    /// Facet filter: use purpose
    #[arg(long)]
    use_purpose: Option<String>,

    /// Facet filter: industry
    #[arg(long)]
    industry: Option<String>,

    /// Facet filter: employee band
    #[arg(long)]
    employees: Option<String>,

    /// Facet filter: target area
    #[arg(long)]
    area: Option<String>,
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
        keyword: args.keyword,
        acceptance: args.acceptance,
        max_import_count: args.count,
        generate_ai: args.no_ai.then_some(false),
        auto_publish: args.auto_publish.then_some(true),
        force_body_update: args.force_body,
        use_purpose: args.use_purpose,
        industry: args.industry,
        target_number_of_employees: args.employees,
        target_area_search: args.area,
        ..Default::default()
    };

    let stats = engine.run_sync(&overrides).await?;
    println!(
        "同期完了: {}件取得, {}件作成, {}件更新, {}件エラー, {}件AI生成",
        stats.fetched, stats.created, stats.updated, stats.errors, stats.ai_generated
    );
    Ok(())
}
