use anyhow::Result;
use clap::Parser;
use pagecast::dispatch::{self, DispatchConfig};
use pagecast::publisher::GraphPublisher;
use pagecast::retry::RetryPolicy;
use pagecast::{config, db};
use std::path::PathBuf;
use tracing::info;

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
        .unwrap_or_else(|_| format!("sqlite://{}/pagecast.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let publisher = GraphPublisher::from_config(&cfg)?;
    let policy = RetryPolicy::new(cfg.scheduler.backoff_base_secs, cfg.scheduler.backoff_cap_secs);
    let dispatch_cfg = DispatchConfig::from_config(&cfg);

    info!("starting dispatch worker");
    tokio::select! {
        _ = dispatch::run(pool, &publisher, policy, dispatch_cfg) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
