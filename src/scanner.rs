//! Periodic search for viral candidates.
//!
//! The dedup claim (`INSERT OR IGNORE`) is the gate: only the caller whose
//! insert lands may publish. Scans are additionally serialized on a mutex.
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config;
use crate::db::{self, collections, Pool};
use crate::model::{QueuedCandidate, ScanResult};
use crate::queue::Publisher;
use crate::scorer;
use crate::twitter::{build_search_query, SocialPlatform};

pub struct Scanner {
    pool: Pool,
    platform: Arc<dyn SocialPlatform>,
    publisher: Arc<dyn Publisher>,
    language: String,
    page_size: u32,
    threshold: f64,
    running: Mutex<()>,
}

impl Scanner {
    pub fn new(
        pool: Pool,
        platform: Arc<dyn SocialPlatform>,
        publisher: Arc<dyn Publisher>,
        cfg: &config::Scanner,
    ) -> Self {
        Self {
            pool,
            platform,
            publisher,
            language: cfg.language.clone(),
            page_size: cfg.page_size,
            threshold: cfg.score_threshold,
            running: Mutex::new(()),
        }
    }

    #[instrument(skip_all)]
    pub async fn scan<S: AsRef<str>>(&self, keywords: &[S]) -> Result<ScanResult> {
        if keywords.iter().all(|k| k.as_ref().trim().is_empty()) {
            return Err(anyhow!("scan needs at least one keyword"));
        }
        let _guard = self.running.lock().await;

        let query = build_search_query(keywords, &self.language);
        let candidates = self
            .platform
            .search_recent(&query, self.page_size)
            .await
            .context("search failed")?;

        let mut result = ScanResult {
            examined: candidates.len(),
            enqueued: 0,
        };
        for candidate in candidates {
            if db::is_handled(&self.pool, &candidate.id).await? {
                debug!(candidate_id = %candidate.id, "already handled");
                continue;
            }
            let score = scorer::viral_score(&candidate.metrics);
            if !scorer::qualifies(score, self.threshold) {
                debug!(candidate_id = %candidate.id, score, "below threshold");
                continue;
            }

            let queued = QueuedCandidate::new(candidate, score);
            let claimed =
                db::claim_handled(&self.pool, queued.id(), Some(score), Some(&queued.url), Utc::now())
                    .await?;
            if !claimed {
                debug!(candidate_id = %queued.id(), "claimed by another scan");
                continue;
            }

            if let Err(err) = self.publisher.publish(&queued).await {
                db::release_claim(&self.pool, queued.id()).await?;
                return Err(err.context(format!("publish failed for {}", queued.id())));
            }
            result.enqueued += 1;
            info!(candidate_id = %queued.id(), score, url = %queued.url, "viral candidate queued");

            let archived = json!({
                "candidate": &queued.candidate,
                "score": score,
                "url": &queued.url,
                "queuedAt": queued.enqueued_at.to_rfc3339(),
            });
            if let Err(err) =
                db::set_document(&self.pool, collections::VIRAL_CANDIDATES, queued.id(), &archived)
                    .await
            {
                warn!(?err, candidate_id = %queued.id(), "could not archive viral candidate");
            }
        }

        info!(examined = result.examined, enqueued = result.enqueued, "scan complete");
        Ok(result)
    }
}
