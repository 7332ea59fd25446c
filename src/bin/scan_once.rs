use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use threadripper::config;
use threadripper::db;
use threadripper::secrets::Secrets;
use threadripper::service::Services;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run a single viral scan and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the configured keywords (repeatable)
    #[arg(long = "keyword")]
    keywords: Vec<String>,
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

    let store = Secrets::from_config(&cfg.secrets)?;
    let services = Services::build(&cfg, &pool, &store).await?;
    let keywords = if args.keywords.is_empty() {
        cfg.scanner.keywords.clone()
    } else {
        args.keywords
    };
    let result = services.scanner.scan(keywords.as_slice()).await?;
    info!(examined = result.examined, enqueued = result.enqueued, "scan finished");
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}
