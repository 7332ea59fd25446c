#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use threadripper::analyzer::Analyzer;
use threadripper::budget::ReplyBudget;
use threadripper::config::{self, Config};
use threadripper::db::{self, Pool};
use threadripper::llm::{ModelError, ReasoningModel};
use threadripper::model::{Candidate, EngagementMetrics, QueuedCandidate};
use threadripper::pipeline::Pipeline;
use threadripper::queue::Publisher;
use threadripper::replier::Replier;
use threadripper::twitter::{PlatformError, SocialPlatform};

pub const GOOD_ANALYSIS: &str = r#"```json
{
  "surface_message": "We raised a seed round",
  "hidden_meaning": "We need you to believe we are winning",
  "power_dynamics": "Borrowed credibility from investors",
  "emotional_tactics": "FOMO",
  "stress_indicators": "Runway talk in every reply",
  "confidence": 85,
  "subtext_score": 8,
  "viral_reply": "Congrats on the raise. The runway math in the replies is the real thread."
}
```"#;

pub async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn sample_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

pub fn candidate(id: &str, likes: u64, replies: u64, shares: u64) -> Candidate {
    Candidate {
        id: id.to_string(),
        text: format!("post {id}: we just closed our seed round"),
        author_id: format!("author-{id}"),
        metrics: EngagementMetrics::new(likes, replies, shares),
        created_at: Utc::now(),
    }
}

pub fn queued(id: &str) -> QueuedCandidate {
    QueuedCandidate::new(candidate(id, 150, 45, 23), 24.9)
}

#[derive(Debug, Clone)]
pub struct PostCall {
    pub parent_id: String,
    pub text: String,
}

/// Platform fake: fixed search results, scripted post responses, recorded posts.
#[derive(Clone, Default)]
pub struct RecordingPlatform {
    pub search_results: Arc<Mutex<Vec<Candidate>>>,
    pub fail_search: Arc<Mutex<bool>>,
    pub replies: Arc<Mutex<Vec<String>>>,
    pub post_responses: Arc<Mutex<VecDeque<Result<String, PlatformError>>>>,
    pub posts: Arc<Mutex<Vec<PostCall>>>,
    pub searches: Arc<Mutex<Vec<String>>>,
}

impl RecordingPlatform {
    pub fn with_results(results: Vec<Candidate>) -> Self {
        Self {
            search_results: Arc::new(Mutex::new(results)),
            ..Default::default()
        }
    }

    pub async fn fail_searches(&self) {
        *self.fail_search.lock().await = true;
    }

    pub async fn push_post_response(&self, response: Result<String, PlatformError>) {
        self.post_responses.lock().await.push_back(response);
    }

    pub async fn posts(&self) -> Vec<PostCall> {
        self.posts.lock().await.clone()
    }
}

#[async_trait]
impl SocialPlatform for RecordingPlatform {
    async fn search_recent(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<Candidate>, PlatformError> {
        self.searches.lock().await.push(query.to_string());
        if *self.fail_search.lock().await {
            return Err(PlatformError::Api {
                status: 503,
                body: "unavailable".into(),
            });
        }
        let results = self.search_results.lock().await.clone();
        Ok(results.into_iter().take(max_results as usize).collect())
    }

    async fn get_post(&self, id: &str) -> Result<Candidate, PlatformError> {
        self.search_results
            .lock()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    async fn fetch_replies(&self, _id: &str, limit: usize) -> Result<Vec<String>, PlatformError> {
        Ok(self.replies.lock().await.iter().take(limit).cloned().collect())
    }

    async fn post_reply(&self, parent_id: &str, text: &str) -> Result<String, PlatformError> {
        let mut posts = self.posts.lock().await;
        posts.push(PostCall {
            parent_id: parent_id.to_string(),
            text: text.to_string(),
        });
        let n = posts.len();
        drop(posts);
        self.post_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(format!("reply-{n}")))
    }
}

/// Model fake: scripted responses, falls back to a well-formed analysis.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    pub responses: Arc<Mutex<VecDeque<Result<String, ModelError>>>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    pub delay: Duration,
}

impl ScriptedModel {
    pub fn with_responses(responses: Vec<Result<String, ModelError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    /// Answers every prompt only after `delay`, like a slow model call.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl ReasoningModel for ScriptedModel {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        self.prompts.lock().await.push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(GOOD_ANALYSIS.to_string()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Publisher fake that records what it was handed, or fails when told to.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    pub published: Arc<Mutex<Vec<QueuedCandidate>>>,
    pub fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub async fn published(&self) -> Vec<QueuedCandidate> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, candidate: &QueuedCandidate) -> Result<String> {
        if self.fail {
            return Err(anyhow!("broker unreachable"));
        }
        let mut published = self.published.lock().await;
        published.push(candidate.clone());
        Ok(format!("msg-{}", published.len()))
    }
}

pub fn build_pipeline(
    pool: &Pool,
    platform: &RecordingPlatform,
    model: &ScriptedModel,
    daily_max: u32,
) -> Pipeline {
    pipeline_with(pool, platform, model, daily_max, true)
}

/// Pipeline whose replier has no posting credentials.
pub fn build_readonly_pipeline(
    pool: &Pool,
    platform: &RecordingPlatform,
    model: &ScriptedModel,
) -> Pipeline {
    pipeline_with(pool, platform, model, 20, false)
}

fn pipeline_with(
    pool: &Pool,
    platform: &RecordingPlatform,
    model: &ScriptedModel,
    daily_max: u32,
    can_post: bool,
) -> Pipeline {
    let cfg = sample_config();
    let platform: Arc<dyn SocialPlatform> = Arc::new(platform.clone());
    let budget = ReplyBudget::new(pool.clone(), daily_max);
    let poster = can_post.then(|| platform.clone());
    let replier = Replier::new(pool.clone(), poster, budget, &cfg.replier);
    Pipeline::new(
        pool.clone(),
        platform,
        Analyzer::new(Arc::new(model.clone())),
        replier,
    )
}
