//! Turns an analysis into a threaded reply under the daily budget.
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::budget::ReplyBudget;
use crate::config;
use crate::db::{self, Pool};
use crate::model::{AnalysisRecord, ReplyOutcome, ReplyStatus};
use crate::twitter::SocialPlatform;

/// Platform limit on post length, in characters.
pub const MAX_REPLY_CHARS: usize = 280;

/// Only precondition and storage failures are errors. Budget exhaustion and
/// platform rejections come back as a non-posted `ReplyOutcome`.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("replier has no posting credentials")]
    NotInitialized,
    #[error("candidate id is empty")]
    EmptyCandidateId,
    #[error("analysis has no viral_reply text")]
    MissingReplyText,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct Replier {
    pool: Pool,
    poster: Option<Arc<dyn SocialPlatform>>,
    budget: ReplyBudget,
    header: String,
    hashtags: Vec<String>,
}

impl Replier {
    /// `poster` is `None` when no user-context credentials are configured.
    pub fn new(
        pool: Pool,
        poster: Option<Arc<dyn SocialPlatform>>,
        budget: ReplyBudget,
        cfg: &config::Replier,
    ) -> Self {
        Self {
            pool,
            poster,
            budget,
            header: cfg.header.clone(),
            hashtags: cfg.hashtags.clone(),
        }
    }

    pub fn budget(&self) -> &ReplyBudget {
        &self.budget
    }

    pub fn can_post(&self) -> bool {
        self.poster.is_some()
    }

    #[instrument(skip_all, fields(candidate_id = %candidate_id))]
    pub async fn reply(
        &self,
        candidate_id: &str,
        analysis: &AnalysisRecord,
    ) -> Result<ReplyOutcome, ReplyError> {
        let poster = self.poster.as_ref().ok_or(ReplyError::NotInitialized)?;
        if candidate_id.trim().is_empty() {
            return Err(ReplyError::EmptyCandidateId);
        }
        if analysis.viral_reply.trim().is_empty() {
            return Err(ReplyError::MissingReplyText);
        }

        // Only the delivery whose claim lands may post. A claim left by a
        // crash mid-post is never retaken, so that reply is skipped for good.
        if !db::claim_reply(&self.pool, candidate_id, Utc::now()).await? {
            info!("reply already posted or in flight; skipping");
            return Ok(ReplyOutcome::skipped(ReplyStatus::AlreadyReplied));
        }

        let reservation = match self.budget.try_reserve().await {
            Ok(Some(r)) => r,
            Ok(None) => {
                info!(max = self.budget.max(), "daily reply budget reached; not posting");
                db::release_reply_claim(&self.pool, candidate_id).await?;
                return Ok(ReplyOutcome::skipped(ReplyStatus::BudgetExhausted));
            }
            Err(err) => {
                if let Err(release_err) = db::release_reply_claim(&self.pool, candidate_id).await {
                    warn!(?release_err, "could not release reply claim");
                }
                return Err(err.into());
            }
        };

        let text = compose_reply(&self.header, &analysis.viral_reply, &self.hashtags);
        match poster.post_reply(candidate_id, &text).await {
            Ok(reply_id) => {
                // The claim stays held, which already blocks a second post.
                if let Err(err) =
                    db::mark_replied(&self.pool, candidate_id, &reply_id, Utc::now()).await
                {
                    error!(?err, %reply_id, "reply posted but marker not stored");
                }
                info!(%reply_id, window = %reservation.window, "reply posted");
                Ok(ReplyOutcome::posted(reply_id))
            }
            Err(err) => {
                warn!(?err, "platform rejected reply");
                self.budget.release(reservation).await?;
                db::release_reply_claim(&self.pool, candidate_id).await?;
                Ok(ReplyOutcome::skipped(ReplyStatus::PlatformRejected))
            }
        }
    }
}

/// `"{header}\n\n{reply}\n\n{hashtags}"`, cut to `MAX_REPLY_CHARS`.
pub fn compose_reply(header: &str, viral_reply: &str, hashtags: &[String]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(3);
    if !header.trim().is_empty() {
        parts.push(header.trim().to_string());
    }
    parts.push(viral_reply.trim().to_string());
    let tags = hashtags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if !tags.is_empty() {
        parts.push(tags);
    }
    let text = parts.join("\n\n");
    if text.chars().count() <= MAX_REPLY_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(MAX_REPLY_CHARS - 1).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_joins_sections() {
        let text = compose_reply(
            "🧠 Thread Psychology Analysis:",
            "  Big raise, bigger runway anxiety.  ",
            &["#ThreadAnalysis".into(), "#SubtextExposed".into()],
        );
        assert_eq!(
            text,
            "🧠 Thread Psychology Analysis:\n\nBig raise, bigger runway anxiety.\n\n#ThreadAnalysis #SubtextExposed"
        );
    }

    #[test]
    fn empty_header_and_tags_are_dropped() {
        assert_eq!(compose_reply("", "just this", &[]), "just this");
    }

    #[test]
    fn long_replies_are_cut_to_limit() {
        let long = "x".repeat(400);
        let text = compose_reply("H", &long, &["#T".into()]);
        assert_eq!(text.chars().count(), MAX_REPLY_CHARS);
        assert!(text.ends_with('…'));
    }
}
