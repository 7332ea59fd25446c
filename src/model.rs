use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engagement counters reported by the source platform.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngagementMetrics {
    pub like_count: u64,
    pub reply_count: u64,
    pub share_count: u64,
}

impl EngagementMetrics {
    pub fn new(like_count: u64, reply_count: u64, share_count: u64) -> Self {
        Self {
            like_count,
            reply_count,
            share_count,
        }
    }
}

/// A post under viral-scan consideration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub text: String,
    pub author_id: String,
    pub metrics: EngagementMetrics,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn canonical_url(&self) -> String {
        canonical_url(&self.id)
    }
}

pub fn canonical_url(id: &str) -> String {
    format!("https://twitter.com/i/web/status/{}", id)
}

/// Queue payload: a qualifying candidate plus what the scanner derived for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedCandidate {
    pub candidate: Candidate,
    pub score: f64,
    pub url: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedCandidate {
    pub fn new(candidate: Candidate, score: f64) -> Self {
        let url = candidate.canonical_url();
        Self {
            candidate,
            score,
            url,
            enqueued_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.candidate.id
    }
}

/// Structured output of the reasoning stage for one candidate.
///
/// `confidence` is always within `0.0..=1.0` and `subtext_score` within
/// `1..=10`; `Analyzer` normalizes model output before building one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRecord {
    pub surface_message: String,
    pub hidden_meaning: String,
    pub power_dynamics: String,
    pub emotional_tactics: String,
    pub stress_indicators: String,
    pub confidence: f64,
    pub subtext_score: u8,
    pub viral_reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl AnalysisRecord {
    /// True when the record was produced by a fallback path.
    pub fn is_degraded(&self) -> bool {
        self.error.is_some() || self.parse_error.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResult {
    pub examined: usize,
    pub enqueued: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Posted,
    AlreadyReplied,
    BudgetExhausted,
    PlatformRejected,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Posted => "posted",
            ReplyStatus::AlreadyReplied => "already_replied",
            ReplyStatus::BudgetExhausted => "budget_exhausted",
            ReplyStatus::PlatformRejected => "platform_rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyOutcome {
    pub posted: bool,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<String>,
}

impl ReplyOutcome {
    pub fn posted(reply_id: String) -> Self {
        Self {
            posted: true,
            status: ReplyStatus::Posted,
            reply_id: Some(reply_id),
        }
    }

    pub fn skipped(status: ReplyStatus) -> Self {
        Self {
            posted: false,
            status,
            reply_id: None,
        }
    }
}

/// Snapshot of the reply budget for one window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetStatus {
    pub window: String,
    pub count: u32,
    pub max: u32,
}

impl BudgetStatus {
    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.count)
    }

    pub fn exhausted(&self) -> bool {
        self.count >= self.max
    }
}
