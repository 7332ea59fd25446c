//! Reasoning-model client. The pipeline only needs free text back; callers
//! parse structure out of it themselves.
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model returned no text")]
    EmptyResponse,
    #[error("invalid model response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ReasoningModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;

    fn name(&self) -> &str;
}

/// Gemini `generateContent` over REST.
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<PartIn<'a>>,
}

#[derive(Serialize)]
struct PartIn<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Deserialize)]
struct ResponseCandidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<PartOut>,
}

#[derive(Deserialize)]
struct PartOut {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let base_url = Url::parse(GEMINI_API_BASE).expect("valid default Gemini URL");
        Self::with_base_url(api_key, model, base_url)
    }

    pub fn with_base_url(api_key: impl Into<String>, model: impl Into<String>, base_url: Url) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn build_request(&self, prompt: &str) -> Result<reqwest::Request, ModelError> {
        let endpoint = self
            .base_url
            .join(&format!("v1beta/models/{}:generateContent", self.model))
            .map_err(|e| ModelError::Decode(format!("invalid model base URL: {e}")))?;
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![PartIn { text: prompt }],
            }],
        };
        Ok(self
            .http
            .post(endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .build()?)
    }
}

#[async_trait]
impl ReasoningModel for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        let request = self.build_request(prompt)?;
        debug!(model = %self.model, prompt_len = prompt.len(), "model request");
        let response = self.http.execute(request).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, body });
        }

        let body = response.text().await?;
        let parsed: GenerateResponse =
            serde_json::from_str(&body).map_err(|e| ModelError::Decode(e.to_string()))?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
