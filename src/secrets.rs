//! Credential lookup with an expiring in-memory cache.
//!
//! Secrets come from Google Secret Manager when a project is configured, else
//! from environment variables. Cached values expire after the configured TTL;
//! `invalidate`/`clear` force a refetch after a credential rotation.
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const TWITTER_BEARER_TOKEN: &str = "TWITTER_BEARER_TOKEN";
pub const TWITTER_USER_ACCESS_TOKEN: &str = "TWITTER_USER_ACCESS_TOKEN";
pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const GCP_ACCESS_TOKEN: &str = "GCP_ACCESS_TOKEN";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),
    #[error("secret source failed for {name}: {message}")]
    Source { name: String, message: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid secret payload: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<String, SecretError>;
}

/// Reads secrets from process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSource;

#[async_trait]
impl SecretSource for EnvSource {
    async fn fetch(&self, name: &str) -> Result<String, SecretError> {
        read_env(name).ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Resolves OAuth access tokens for Google APIs: `GCP_ACCESS_TOKEN` when set,
/// otherwise the instance metadata server (cached until shortly before expiry).
pub struct GcpAuth {
    http: Client,
    metadata_url: Url,
    cached: Mutex<Option<(String, Instant)>>,
}

impl fmt::Debug for GcpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcpAuth")
            .field("metadata_url", &self.metadata_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl Default for GcpAuth {
    fn default() -> Self {
        Self::with_metadata_url(Url::parse(METADATA_TOKEN_URL).expect("valid metadata URL"))
    }
}

impl GcpAuth {
    pub fn with_metadata_url(metadata_url: Url) -> Self {
        Self {
            http: Client::new(),
            metadata_url,
            cached: Mutex::new(None),
        }
    }

    pub async fn access_token(&self) -> Result<String, SecretError> {
        if let Some(token) = read_env(GCP_ACCESS_TOKEN) {
            return Ok(token);
        }
        if let Some((token, expires)) = self.cached.lock().await.as_ref() {
            if Instant::now() < *expires {
                return Ok(token.clone());
            }
        }

        // Concurrent callers may both fetch; the last one to finish is kept.
        let res = self
            .http
            .get(self.metadata_url.clone())
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(SecretError::Source {
                name: "gcp access token".into(),
                message: format!("metadata server returned {}", res.status()),
            });
        }
        let token: MetadataToken = res
            .json()
            .await
            .map_err(|e| SecretError::Decode(e.to_string()))?;
        // Refresh a minute early.
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *self.cached.lock().await = Some((token.access_token.clone(), Instant::now() + lifetime));
        debug!("refreshed gcp access token");
        Ok(token.access_token)
    }
}

/// Google Secret Manager `versions/latest:access`.
pub struct SecretManagerSource {
    http: Client,
    base_url: Url,
    project_id: String,
    auth: Arc<GcpAuth>,
}

impl fmt::Debug for SecretManagerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretManagerSource")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct AccessSecretResp {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

impl SecretManagerSource {
    pub fn new(base_url: Url, project_id: impl Into<String>, auth: Arc<GcpAuth>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            project_id: project_id.into(),
            auth,
        }
    }
}

#[async_trait]
impl SecretSource for SecretManagerSource {
    async fn fetch(&self, name: &str) -> Result<String, SecretError> {
        let url = self
            .base_url
            .join(&format!(
                "v1/projects/{}/secrets/{}/versions/latest:access",
                self.project_id, name
            ))
            .map_err(|e| SecretError::Decode(e.to_string()))?;
        let token = self.auth.access_token().await?;
        let res = self.http.get(url).bearer_auth(token).send().await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(name.to_string()));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SecretError::Source {
                name: name.to_string(),
                message: format!("{}: {}", status, body),
            });
        }
        let resp: AccessSecretResp = res
            .json()
            .await
            .map_err(|e| SecretError::Decode(e.to_string()))?;
        let bytes = BASE64
            .decode(resp.payload.data.as_bytes())
            .map_err(|e| SecretError::Decode(e.to_string()))?;
        let value = String::from_utf8(bytes).map_err(|e| SecretError::Decode(e.to_string()))?;
        info!(secret = name, "fetched secret");
        Ok(value.trim().to_string())
    }
}

struct CachedSecret {
    value: String,
    fetched_at: Instant,
}

pub struct Secrets {
    source: Arc<dyn SecretSource>,
    env_fallback: bool,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedSecret>>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("env_fallback", &self.env_fallback)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Secrets {
    pub fn new(source: Arc<dyn SecretSource>, ttl: Duration, env_fallback: bool) -> Self {
        Self {
            source,
            env_fallback,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Secret Manager when `cfg.project_id` is set, else the environment.
    pub fn from_config(cfg: &crate::config::Secrets) -> anyhow::Result<Self> {
        let source: Arc<dyn SecretSource> = match &cfg.project_id {
            Some(project) => Arc::new(SecretManagerSource::new(
                Url::parse(&cfg.api_base)?,
                project.clone(),
                Arc::new(GcpAuth::default()),
            )),
            None => Arc::new(EnvSource),
        };
        Ok(Self::new(
            source,
            Duration::from_secs(cfg.cache_ttl_seconds),
            cfg.env_fallback,
        ))
    }

    pub async fn get(&self, name: &str) -> Result<String, SecretError> {
        if let Some(hit) = self.cached(name).await {
            return Ok(hit);
        }
        let value = match self.source.fetch(name).await {
            Ok(v) => v,
            Err(err) if self.env_fallback => match read_env(name) {
                Some(v) => {
                    warn!(secret = name, %err, "secret source failed; using environment");
                    v
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        };
        self.cache.write().await.insert(
            name.to_string(),
            CachedSecret {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Like `get`, but a missing secret is `None` rather than an error.
    pub async fn get_optional(&self, name: &str) -> Result<Option<String>, SecretError> {
        match self.get(name).await {
            Ok(v) => Ok(Some(v)),
            Err(SecretError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn invalidate(&self, name: &str) {
        self.cache.write().await.remove(name);
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    async fn cached(&self, name: &str) -> Option<String> {
        let cache = self.cache.read().await;
        let entry = cache.get(name)?;
        if self.ttl.is_zero() || entry.fetched_at.elapsed() >= self.ttl {
            debug!(secret = name, "cached secret expired");
            return None;
        }
        Some(entry.value.clone())
    }
}
