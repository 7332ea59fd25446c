use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Candidate, EngagementMetrics};

#[derive(Deserialize, Debug, Default, Clone, Copy)]
pub struct PublicMetrics {
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub retweet_count: u64,
    #[serde(default)]
    pub quote_count: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiTweet {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub public_metrics: Option<PublicMetrics>,
}

impl From<ApiTweet> for Candidate {
    fn from(t: ApiTweet) -> Self {
        let m = t.public_metrics.unwrap_or_default();
        Candidate {
            id: t.id,
            text: t.text,
            author_id: t.author_id.unwrap_or_default(),
            metrics: EngagementMetrics::new(m.like_count, m.reply_count, m.retweet_count),
            created_at: t.created_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct SearchResp {
    #[serde(default)]
    pub data: Option<Vec<ApiTweet>>,
}

#[derive(Deserialize, Debug)]
pub struct LookupResp {
    #[serde(default)]
    pub data: Option<ApiTweet>,
}

#[derive(Serialize, Debug)]
pub struct CreateTweetReq<'a> {
    pub text: &'a str,
    pub reply: ReplySettings<'a>,
}

#[derive(Serialize, Debug)]
pub struct ReplySettings<'a> {
    pub in_reply_to_tweet_id: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct CreateTweetResp {
    pub data: CreatedTweet,
}

#[derive(Deserialize, Debug)]
pub struct CreatedTweet {
    pub id: String,
}
