use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use threadripper::config;
use threadripper::db;
use threadripper::outbox;
use threadripper::secrets::Secrets;
use threadripper::service::Services;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Deliver every pending outbox message through the pipeline and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit as soon as only messages in backoff remain
    #[arg(long)]
    skip_failed: bool,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let remaining = db::count_pending_messages(&pool).await?;
    info!(remaining, "initial outbox state");
    if remaining == 0 {
        info!("no outbox messages to deliver, exiting");
        return Ok(());
    }

    let store = Secrets::from_config(&cfg.secrets)?;
    let services = Services::build(&cfg, &pool, &store).await?;
    let max_backoff = cfg.app.max_backoff_seconds as i64;
    let max_attempts = cfg.app.max_attempts as i32;
    let mut processed = 0_u64;

    loop {
        match outbox::process_next_message(&pool, &services.pipeline, max_backoff, max_attempts)
            .await
        {
            Ok(true) => {
                processed += 1;
                if processed % 10 == 0 {
                    let remaining = db::count_pending_messages(&pool).await?;
                    info!(processed, remaining, "drain progress");
                }
            }
            Ok(false) => {
                let remaining = db::count_pending_messages(&pool).await?;
                if remaining == 0 {
                    info!(processed, "outbox drained");
                    break;
                }
                let highest_attempt = db::max_pending_attempt(&pool).await?;
                warn!(remaining, highest_attempt, "all remaining messages are in backoff");
                if args.skip_failed {
                    return Err(anyhow!("{remaining} messages left in backoff"));
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Err(err) => {
                error!(?err, "error delivering outbox message");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
    Ok(())
}
