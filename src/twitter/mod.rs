use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::Candidate;
use crate::twitter::model::{
    CreateTweetReq, CreateTweetResp, LookupResp, ReplySettings, SearchResp,
};

pub mod model;

const TWITTER_API_BASE: &str = "https://api.twitter.com/";
const TWEET_FIELDS: &str = "created_at,public_metrics,author_id,conversation_id";

/// Recent-search accepts `max_results` in this range only.
pub const MIN_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("rate limited by platform: {0}")]
    RateLimited(String),
    #[error("post not found: {0}")]
    NotFound(String),
    #[error("platform rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },
    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),
    #[error("platform error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid platform response: {0}")]
    Decode(String),
}

/// Source-platform capabilities used by the pipeline.
#[async_trait]
pub trait SocialPlatform: Send + Sync {
    /// Recent posts matching `query`, in the order the platform returns them.
    async fn search_recent(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<Candidate>, PlatformError>;

    async fn get_post(&self, id: &str) -> Result<Candidate, PlatformError>;

    /// Text of up to `limit` replies in the conversation started by `id`.
    async fn fetch_replies(&self, id: &str, limit: usize) -> Result<Vec<String>, PlatformError>;

    /// Post `text` as a threaded reply to `parent_id`; returns the new post id.
    async fn post_reply(&self, parent_id: &str, text: &str) -> Result<String, PlatformError>;
}

/// X API v2 client. Reads use the app bearer token, writes use an OAuth 2.0
/// user-context access token.
#[derive(Clone)]
pub struct TwitterClient {
    http: Client,
    base_url: Url,
    bearer_token: Option<String>,
    user_token: Option<String>,
}

impl fmt::Debug for TwitterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitterClient")
            .field("base_url", &self.base_url)
            .field("can_read", &self.bearer_token.is_some())
            .field("can_post", &self.user_token.is_some())
            .finish_non_exhaustive()
    }
}

impl TwitterClient {
    pub fn new(bearer_token: Option<String>, user_token: Option<String>) -> Self {
        let base_url = Url::parse(TWITTER_API_BASE).expect("valid default Twitter URL");
        Self::with_base_url(bearer_token, user_token, base_url)
    }

    pub fn with_base_url(
        bearer_token: Option<String>,
        user_token: Option<String>,
        base_url: Url,
    ) -> Self {
        let http = Client::builder()
            .user_agent("threadripper/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            bearer_token: bearer_token.filter(|t| !t.trim().is_empty()),
            user_token: user_token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn can_post(&self) -> bool {
        self.user_token.is_some()
    }

    fn read_token(&self) -> Result<&str, PlatformError> {
        self.bearer_token
            .as_deref()
            .ok_or(PlatformError::MissingCredentials("bearer token"))
    }

    fn endpoint(&self, path: &str) -> Result<Url, PlatformError> {
        self.base_url
            .join(path)
            .map_err(|e| PlatformError::Decode(format!("invalid Twitter base URL: {e}")))
    }

    pub fn build_search_request(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<reqwest::Request, PlatformError> {
        let token = self.read_token()?;
        let max_results = max_results.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE).to_string();
        let request = self
            .http
            .get(self.endpoint("2/tweets/search/recent")?)
            .bearer_auth(token)
            .query(&[
                ("query", query),
                ("max_results", max_results.as_str()),
                ("tweet.fields", TWEET_FIELDS),
            ])
            .build()?;
        Ok(request)
    }

    pub fn build_reply_request(
        &self,
        parent_id: &str,
        text: &str,
    ) -> Result<reqwest::Request, PlatformError> {
        let token = self
            .user_token
            .as_deref()
            .ok_or(PlatformError::MissingCredentials("user access token"))?;
        let body = CreateTweetReq {
            text,
            reply: ReplySettings {
                in_reply_to_tweet_id: parent_id,
            },
        };
        let request = self
            .http
            .post(self.endpoint("2/tweets")?)
            .bearer_auth(token)
            .json(&body)
            .build()?;
        Ok(request)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::Request,
    ) -> Result<T, PlatformError> {
        debug!(url = %request.url().path(), method = %request.method(), "twitter request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_failure(status, body));
        }
        let body = res.text().await?;
        serde_json::from_str(&body).map_err(|e| PlatformError::Decode(e.to_string()))
    }
}

fn classify_failure(status: StatusCode, body: String) -> PlatformError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            warn!("rate limited by Twitter");
            PlatformError::RateLimited(body)
        }
        StatusCode::NOT_FOUND => PlatformError::NotFound(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Unauthorized {
            status: status.as_u16(),
            body,
        },
        _ => PlatformError::Api {
            status: status.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl SocialPlatform for TwitterClient {
    async fn search_recent(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<Candidate>, PlatformError> {
        let request = self.build_search_request(query, max_results)?;
        let resp: SearchResp = self.execute(request).await?;
        let mut tweets: Vec<Candidate> = resp
            .data
            .unwrap_or_default()
            .into_iter()
            .map(Candidate::from)
            .collect();
        // The API never returns fewer than MIN_PAGE_SIZE when available; honour
        // smaller configured caps locally.
        tweets.truncate(max_results.max(1) as usize);
        info!(count = tweets.len(), "search returned posts");
        Ok(tweets)
    }

    async fn get_post(&self, id: &str) -> Result<Candidate, PlatformError> {
        let token = self.read_token()?;
        let request = self
            .http
            .get(self.endpoint(&format!("2/tweets/{}", id))?)
            .bearer_auth(token)
            .query(&[("tweet.fields", TWEET_FIELDS)])
            .build()?;
        let resp: LookupResp = self.execute(request).await?;
        resp.data
            .map(Candidate::from)
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    async fn fetch_replies(&self, id: &str, limit: usize) -> Result<Vec<String>, PlatformError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = format!("conversation_id:{} is:reply", id);
        let request = self.build_search_request(&query, limit as u32)?;
        let resp: SearchResp = self.execute(request).await?;
        Ok(resp
            .data
            .unwrap_or_default()
            .into_iter()
            .take(limit)
            .map(|t| t.text)
            .collect())
    }

    async fn post_reply(&self, parent_id: &str, text: &str) -> Result<String, PlatformError> {
        let request = self.build_reply_request(parent_id, text)?;
        let resp: CreateTweetResp = self.execute(request).await?;
        info!(parent_id, reply_id = %resp.data.id, "posted reply");
        Ok(resp.data.id)
    }
}

/// Search query: keyword OR-group, no reshares or replies, one language.
pub fn build_search_query<S: AsRef<str>>(keywords: &[S], language: &str) -> String {
    let terms: Vec<String> = keywords
        .iter()
        .map(|k| k.as_ref().trim())
        .filter(|k| !k.is_empty())
        .map(|k| {
            if k.contains(char::is_whitespace) {
                format!("\"{}\"", k.replace('"', ""))
            } else {
                k.to_string()
            }
        })
        .collect();
    format!("({}) -is:retweet -is:reply lang:{}", terms.join(" OR "), language)
}

static STATUS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://(?:www\.|mobile\.)?(?:twitter|x)\.com/(?:[A-Za-z0-9_]+|i/web)/status(?:es)?/(\d+)")
        .expect("valid status url regex")
});

/// Extract the post id from a `twitter.com` / `x.com` status URL.
pub fn parse_status_url(url: &str) -> Option<String> {
    STATUS_URL
        .captures(url.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
