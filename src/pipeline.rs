//! One unit of work per delivered queue message: redelivery check, analysis,
//! archive, reply. Shared by the outbox worker and the push endpoint.
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::analyzer::{Analyzer, MAX_REPLY_EXCERPTS};
use crate::db::{self, collections, Pool};
use crate::model::{AnalysisRecord, Candidate, QueuedCandidate, ReplyOutcome, ReplyStatus};
use crate::replier::{ReplyError, Replier};
use crate::scorer;
use crate::twitter::{PlatformError, SocialPlatform};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub candidate_id: String,
    /// `None` when the candidate was already replied to and analysis was skipped.
    pub analysis: Option<AnalysisRecord>,
    /// `None` when the reply stage refused on a precondition.
    pub reply: Option<ReplyOutcome>,
}

pub struct Pipeline {
    pool: Pool,
    platform: Arc<dyn SocialPlatform>,
    analyzer: Analyzer,
    replier: Replier,
}

impl Pipeline {
    pub fn new(
        pool: Pool,
        platform: Arc<dyn SocialPlatform>,
        analyzer: Analyzer,
        replier: Replier,
    ) -> Self {
        Self {
            pool,
            platform,
            analyzer,
            replier,
        }
    }

    pub fn replier(&self) -> &Replier {
        &self.replier
    }

    pub fn model_name(&self) -> &str {
        self.analyzer.model_name()
    }

    /// Errors only on storage failures; the caller should redeliver.
    #[instrument(skip_all, fields(candidate_id = %queued.id()))]
    pub async fn process(&self, queued: &QueuedCandidate) -> Result<DeliveryReport> {
        let candidate_id = queued.id().to_string();
        if db::has_replied(&self.pool, &candidate_id).await? {
            info!("redelivered candidate already replied to; acknowledging");
            return Ok(DeliveryReport {
                candidate_id,
                analysis: None,
                reply: Some(ReplyOutcome::skipped(ReplyStatus::AlreadyReplied)),
            });
        }

        let analysis = self.analyze_candidate(&queued.candidate).await;

        let reply = match self.replier.reply(&candidate_id, &analysis).await {
            Ok(outcome) => Some(outcome),
            Err(ReplyError::Store(err)) => return Err(err),
            Err(err) => {
                warn!(%err, "reply skipped");
                None
            }
        };

        self.archive(&queued.candidate, Some(queued.score), &analysis, reply.as_ref())
            .await?;
        info!(
            degraded = analysis.is_degraded(),
            posted = reply.as_ref().map(|r| r.posted).unwrap_or(false),
            "candidate processed"
        );
        Ok(DeliveryReport {
            candidate_id,
            analysis: Some(analysis),
            reply,
        })
    }

    /// Fetch reply excerpts (best effort) and run the analyzer. Never posts.
    pub async fn analyze_candidate(&self, candidate: &Candidate) -> AnalysisRecord {
        let replies = match self
            .platform
            .fetch_replies(&candidate.id, MAX_REPLY_EXCERPTS)
            .await
        {
            Ok(r) => r,
            Err(err) => {
                warn!(?err, candidate_id = %candidate.id, "could not fetch replies; analyzing post alone");
                Vec::new()
            }
        };
        self.analyzer.analyze(candidate, &replies).await
    }

    /// Manual analysis of one post by id. Archived, never replied to.
    #[instrument(skip_all, fields(post_id = %post_id))]
    pub async fn analyze_post(
        &self,
        post_id: &str,
    ) -> Result<(Candidate, AnalysisRecord), PlatformError> {
        let candidate = self.platform.get_post(post_id).await?;
        let analysis = self.analyze_candidate(&candidate).await;
        let score = scorer::viral_score(&candidate.metrics);
        if let Err(err) = self.archive(&candidate, Some(score), &analysis, None).await {
            warn!(?err, "could not archive manual analysis");
        }
        Ok((candidate, analysis))
    }

    /// Store an analysis in the `bot_responses` collection.
    pub async fn archive(
        &self,
        candidate: &Candidate,
        score: Option<f64>,
        analysis: &AnalysisRecord,
        reply: Option<&ReplyOutcome>,
    ) -> Result<()> {
        let body = json!({
            "candidateId": candidate.id,
            "url": candidate.canonical_url(),
            "text": candidate.text,
            "score": score,
            "model": self.analyzer.model_name(),
            "analysis": analysis,
            "degraded": analysis.is_degraded(),
            "replyStatus": reply.map(|r| r.status.as_str()),
            "replyId": reply.and_then(|r| r.reply_id.clone()),
            "analyzedAt": Utc::now().to_rfc3339(),
        });
        db::set_document(&self.pool, collections::BOT_RESPONSES, &candidate.id, &body).await
    }
}
