use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use jgrants_sync::config;
use jgrants_sync::jgrants::JGrantsClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Health check against the subsidy API")]
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

    let client = JGrantsClient::new(
        &cfg.source.base_url,
        Duration::from_secs(cfg.source.timeout_seconds),
    )?;

    match client.test_connection().await {
        Ok(count) => {
            println!("source OK: probe search returned {count} subsidies");
            Ok(())
        }
        Err(err) => {
            eprintln!("source check failed: {err}");
            std::process::exit(1);
        }
    }
}
