use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use threadripper::api::{self, AppState};
use threadripper::budget::ReplyBudget;
use threadripper::config::{self, Config, QueueMode};
use threadripper::db::{self, Pool};
use threadripper::outbox;
use threadripper::secrets::Secrets;
use threadripper::service::{self, ServiceHandle};

const RETENTION_SWEEP: Duration = Duration::from_secs(3600);

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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    // Serve even when credentials are missing; dependent routes answer 503
    // until the supervisor's first build lands.
    let store = Arc::new(Secrets::from_config(&cfg.secrets)?);
    let services = ServiceHandle::default();
    if let Err(err) = service::refresh(&cfg, &pool, &store, &services).await {
        error!(?err, "pipeline unavailable at startup; retrying in background");
    }
    tokio::spawn(service::supervise(
        cfg.clone(),
        pool.clone(),
        store,
        services.clone(),
    ));

    if cfg.queue.mode == QueueMode::Outbox {
        spawn_outbox_worker(pool.clone(), services.clone(), &cfg);
    }
    spawn_scheduled_scans(services.clone(), &cfg);
    spawn_retention_sweep(pool.clone(), cfg.dedup.retention_days);

    let state = AppState {
        pool: pool.clone(),
        budget: ReplyBudget::new(pool, cfg.replier.daily_max),
        keywords: Arc::new(cfg.scanner.keywords.clone()),
        services,
    };
    let app = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr).await?;
    info!(addr = %cfg.app.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn spawn_outbox_worker(pool: Pool, services: ServiceHandle, cfg: &Config) {
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;
    let max_attempts = cfg.app.max_attempts as i32;
    tokio::spawn(async move {
        loop {
            let Some(pipeline) = services.pipeline().await else {
                tokio::time::sleep(poll_sleep).await;
                continue;
            };
            match outbox::process_next_message(&pool, &pipeline, max_backoff, max_attempts).await {
                Ok(processed) => {
                    if !processed {
                        tokio::time::sleep(poll_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "outbox worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
}

fn spawn_scheduled_scans(services: ServiceHandle, cfg: &Config) {
    if cfg.scanner.interval_minutes == 0 {
        info!("scheduled scans disabled");
        return;
    }
    let period = Duration::from_secs(cfg.scanner.interval_minutes * 60);
    let keywords = cfg.scanner.keywords.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Some(scanner) = services.scanner().await else {
                warn!("scheduled scan skipped; scanner not initialized");
                continue;
            };
            match scanner.scan(keywords.as_slice()).await {
                Ok(result) => info!(
                    examined = result.examined,
                    enqueued = result.enqueued,
                    "scheduled scan finished"
                ),
                Err(err) => warn!(?err, "scheduled scan failed"),
            }
        }
    });
}

fn spawn_retention_sweep(pool: Pool, retention_days: u32) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
            match db::prune_handled_before(&pool, cutoff).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, %cutoff, "pruned dedup records"),
                Err(err) => warn!(?err, "dedup retention sweep failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
