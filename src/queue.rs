//! Queue boundary between the scanner and the analysis pipeline.
//!
//! Every transport carries the same payload: base64 of the JSON-encoded
//! [`QueuedCandidate`]. The local outbox stores it as-is and Pub/Sub wraps it
//! in a push envelope, so both paths decode through [`decode_data`].
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::model::QueuedCandidate;
use crate::secrets::GcpAuth;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Json(String),
    #[error("envelope has no message data")]
    MissingData,
    #[error("message data is not base64: {0}")]
    Base64(String),
    #[error("message data is not a candidate: {0}")]
    Payload(String),
    #[error("candidate has an empty id")]
    EmptyId,
}

/// Push delivery body: `{"message": {"data": "...", "messageId": "..."}, "subscription": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, rename = "messageId", alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

pub fn encode_data(candidate: &QueuedCandidate) -> Result<String> {
    let json = serde_json::to_vec(candidate).context("serialize queued candidate")?;
    Ok(BASE64.encode(json))
}

pub fn decode_data(data: &str) -> Result<QueuedCandidate, EnvelopeError> {
    let bytes = BASE64
        .decode(data.trim().as_bytes())
        .map_err(|e| EnvelopeError::Base64(e.to_string()))?;
    let queued: QueuedCandidate =
        serde_json::from_slice(&bytes).map_err(|e| EnvelopeError::Payload(e.to_string()))?;
    if queued.candidate.id.trim().is_empty() {
        return Err(EnvelopeError::EmptyId);
    }
    Ok(queued)
}

/// Decode a raw push body. Anything short of a complete candidate is an error.
pub fn decode_envelope(body: &[u8]) -> Result<(PushEnvelope, QueuedCandidate), EnvelopeError> {
    let envelope: PushEnvelope =
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    let data = envelope
        .message
        .data
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .ok_or(EnvelopeError::MissingData)?;
    let queued = decode_data(data)?;
    Ok((envelope, queued))
}

/// Hands a qualifying candidate to the queue. Returns the transport's message id.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, candidate: &QueuedCandidate) -> Result<String>;
}

/// Writes to the local outbox table; `outbox::process_next_message` drains it.
#[derive(Debug, Clone)]
pub struct OutboxPublisher {
    pool: Pool,
}

impl OutboxPublisher {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Publisher for OutboxPublisher {
    #[instrument(skip_all)]
    async fn publish(&self, candidate: &QueuedCandidate) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let data = encode_data(candidate)?;
        let row = db::enqueue_message(&self.pool, &message_id, candidate.id(), &data, Utc::now())
            .await?;
        info!(row, %message_id, candidate_id = candidate.id(), "queued candidate in outbox");
        Ok(message_id)
    }
}

/// Publishes to a Google Pub/Sub topic over REST.
pub struct PubSubPublisher {
    http: Client,
    base_url: Url,
    project_id: String,
    topic: String,
    auth: Arc<GcpAuth>,
}

impl fmt::Debug for PubSubPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubPublisher")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: Vec<PublishMessage<'a>>,
}

#[derive(Serialize)]
struct PublishMessage<'a> {
    data: &'a str,
    attributes: HashMap<&'static str, &'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

impl PubSubPublisher {
    pub fn new(
        base_url: Url,
        project_id: impl Into<String>,
        topic: impl Into<String>,
        auth: Arc<GcpAuth>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url,
            project_id: project_id.into(),
            topic: topic.into(),
            auth,
        }
    }

    fn endpoint(&self) -> Result<Url> {
        Ok(self.base_url.join(&format!(
            "v1/projects/{}/topics/{}:publish",
            self.project_id, self.topic
        ))?)
    }
}

#[async_trait]
impl Publisher for PubSubPublisher {
    #[instrument(skip_all)]
    async fn publish(&self, candidate: &QueuedCandidate) -> Result<String> {
        let data = encode_data(candidate)?;
        let mut attributes = HashMap::new();
        attributes.insert("candidateId", candidate.id());
        let body = PublishRequest {
            messages: vec![PublishMessage {
                data: &data,
                attributes,
            }],
        };
        let token = self.auth.access_token().await?;
        let res = self
            .http
            .post(self.endpoint()?)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("pubsub publish failed: {} {}", status, text));
        }
        let resp: PublishResponse = res.json().await.context("decode publish response")?;
        let message_id = resp
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("pubsub publish returned no message id"))?;
        info!(%message_id, topic = %self.topic, candidate_id = candidate.id(), "published candidate");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Candidate, EngagementMetrics};
    use serde_json::json;

    fn queued() -> QueuedCandidate {
        QueuedCandidate::new(
            Candidate {
                id: "T1".into(),
                text: "Raised our seed round today".into(),
                author_id: "A1".into(),
                metrics: EngagementMetrics::new(150, 45, 23),
                created_at: Utc::now(),
            },
            24.9,
        )
    }

    #[test]
    fn push_envelope_decodes_candidate() {
        let q = queued();
        let body = json!({
            "message": {"data": encode_data(&q).unwrap(), "messageId": "m-1"},
            "subscription": "projects/p/subscriptions/s"
        });
        let (env, decoded) = decode_envelope(body.to_string().as_bytes()).unwrap();
        assert_eq!(env.message.message_id.as_deref(), Some("m-1"));
        assert_eq!(decoded.candidate, q.candidate);
    }

    #[test]
    fn empty_object_is_missing_data() {
        let err = decode_envelope(b"{}").unwrap_err();
        assert!(matches!(err, EnvelopeError::Json(_)));
        let err = decode_envelope(br#"{"message":{}}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingData));
    }

    #[test]
    fn garbage_payloads_are_rejected() {
        assert!(matches!(
            decode_data("***not base64***"),
            Err(EnvelopeError::Base64(_))
        ));
        let not_candidate = BASE64.encode(br#"{"hello":"world"}"#);
        assert!(matches!(
            decode_data(&not_candidate),
            Err(EnvelopeError::Payload(_))
        ));
    }

    #[test]
    fn blank_candidate_id_is_rejected() {
        let mut q = queued();
        q.candidate.id = "  ".into();
        let data = encode_data(&q).unwrap();
        assert!(matches!(decode_data(&data), Err(EnvelopeError::EmptyId)));
    }

    #[tokio::test]
    async fn outbox_publisher_stores_encoded_payload() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let publisher = OutboxPublisher::new(pool.clone());
        let q = queued();
        publisher.publish(&q).await.unwrap();

        let msg = db::next_due_message(&pool).await.unwrap().unwrap();
        assert_eq!(msg.candidate_id, "T1");
        assert_eq!(decode_data(&msg.data).unwrap().candidate, q.candidate);
    }
}
