//! Wires configuration, credentials and clients into the pipeline components.
//!
//! `ServiceHandle` is the shared slot the HTTP routes and background workers
//! read from. `supervise` fills it once credentials resolve and rebuilds it
//! every secret TTL, so rotated credentials reach new clients.
use anyhow::{Context, Result};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::analyzer::Analyzer;
use crate::budget::ReplyBudget;
use crate::config::{Config, QueueMode};
use crate::db::{self, Pool};
use crate::llm::GeminiClient;
use crate::pipeline::Pipeline;
use crate::queue::{OutboxPublisher, PubSubPublisher, Publisher};
use crate::replier::Replier;
use crate::scanner::Scanner;
use crate::secrets::{self, GcpAuth, Secrets};
use crate::twitter::{SocialPlatform, TwitterClient};

const MIN_REFRESH: Duration = Duration::from_secs(60);
const MAX_RETRY_SECS: i64 = 300;

#[derive(Clone)]
pub struct Services {
    pub scanner: Arc<Scanner>,
    pub pipeline: Arc<Pipeline>,
}

impl Services {
    pub async fn build(cfg: &Config, pool: &Pool, store: &Secrets) -> Result<Self> {
        let bearer = store.get_optional(secrets::TWITTER_BEARER_TOKEN).await?;
        let user_token = store
            .get_optional(secrets::TWITTER_USER_ACCESS_TOKEN)
            .await?;
        let gemini_key = store
            .get(secrets::GEMINI_API_KEY)
            .await
            .context("reasoning model key is required")?;

        let twitter = Arc::new(TwitterClient::with_base_url(
            bearer,
            user_token,
            Url::parse(&cfg.twitter.api_base).context("twitter.api_base")?,
        ));
        let platform: Arc<dyn SocialPlatform> = twitter.clone();
        let poster = if twitter.can_post() {
            Some(platform.clone())
        } else {
            warn!("no user access token; replies are disabled");
            None
        };

        let model = GeminiClient::with_base_url(
            gemini_key,
            cfg.model.name.clone(),
            Url::parse(&cfg.model.api_base).context("model.api_base")?,
        );

        let publisher: Arc<dyn Publisher> = match cfg.queue.mode {
            QueueMode::Outbox => Arc::new(OutboxPublisher::new(pool.clone())),
            QueueMode::Pubsub => Arc::new(PubSubPublisher::new(
                Url::parse(&cfg.queue.api_base).context("queue.api_base")?,
                cfg.queue.project_id.clone(),
                cfg.queue.topic.clone(),
                Arc::new(GcpAuth::default()),
            )),
        };

        let budget = ReplyBudget::new(pool.clone(), cfg.replier.daily_max);
        let replier = Replier::new(pool.clone(), poster, budget, &cfg.replier);
        let pipeline = Pipeline::new(
            pool.clone(),
            platform.clone(),
            Analyzer::new(Arc::new(model)),
            replier,
        );
        let scanner = Scanner::new(pool.clone(), platform, publisher, &cfg.scanner);
        info!(queue = ?cfg.queue.mode, model = %cfg.model.name, "pipeline ready");

        Ok(Self {
            scanner: Arc::new(scanner),
            pipeline: Arc::new(pipeline),
        })
    }
}

/// Shared, swappable pipeline components. Empty until the first build lands.
#[derive(Clone, Default)]
pub struct ServiceHandle {
    inner: Arc<RwLock<Option<Services>>>,
}

impl ServiceHandle {
    pub fn ready(services: Services) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(services))),
        }
    }

    pub async fn install(&self, services: Services) {
        *self.inner.write().await = Some(services);
    }

    pub async fn scanner(&self) -> Option<Arc<Scanner>> {
        self.inner.read().await.as_ref().map(|s| s.scanner.clone())
    }

    pub async fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.inner.read().await.as_ref().map(|s| s.pipeline.clone())
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.is_some()
    }
}

/// Build from the current secrets and swap the result into `handle`. On
/// failure the previous components stay in place.
pub async fn refresh(cfg: &Config, pool: &Pool, store: &Secrets, handle: &ServiceHandle) -> Result<()> {
    let services = Services::build(cfg, pool, store).await?;
    handle.install(services).await;
    Ok(())
}

/// Keep `handle` populated for the life of the process: retry a failed build
/// with capped backoff, otherwise rebuild once per secret TTL.
pub async fn supervise(cfg: Config, pool: Pool, store: Arc<Secrets>, handle: ServiceHandle) {
    let period = Duration::from_secs(cfg.secrets.cache_ttl_seconds).max(MIN_REFRESH);
    let mut failures: i32 = if handle.is_ready().await { 0 } else { 1 };
    loop {
        let wait = if failures > 0 {
            Duration::from_secs(db::backoff_secs(failures - 1, MAX_RETRY_SECS) as u64)
        } else {
            period
        };
        tokio::time::sleep(wait).await;

        match refresh(&cfg, &pool, &store, &handle).await {
            Ok(()) => {
                if failures > 0 {
                    info!(failures, "pipeline recovered");
                }
                failures = 0;
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                if handle.is_ready().await {
                    warn!(?err, failures, "credential refresh failed; keeping current clients");
                } else {
                    warn!(?err, failures, "pipeline still unavailable");
                }
            }
        }
    }
}
