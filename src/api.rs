//! HTTP surface: liveness, stats, manual triggers, and the push intake.
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::budget::ReplyBudget;
use crate::db::{self, collections, DocQuery, Pool, SortOrder};
use crate::queue;
use crate::service::ServiceHandle;
use crate::twitter::{parse_status_url, PlatformError};

const RECENT_ANALYSES: u32 = 5;

/// `services` starts empty so the server can come up (and say 503) before
/// credentials resolve.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub budget: ReplyBudget,
    pub keywords: Arc<Vec<String>>,
    pub services: ServiceHandle,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn unavailable(component: &str) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: format!("{component} not initialized"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(?err, "request failed");
        ApiError::internal(format!("{err:#}"))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/analyze-thread", post(analyze_thread))
        .route("/api/start-monitoring", post(start_monitoring))
        .route("/pubsub/push", post(pubsub_push))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    match db::health_check(&state.pool).await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339(),
            "scanner": state.services.scanner().await.is_some(),
            "pipeline": state.services.pipeline().await.is_some(),
        }))
        .into_response(),
        Err(err) => {
            warn!(?err, "health check failed");
            ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "database unavailable".into(),
            }
            .into_response()
        }
    }
}

async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = &state.pool;
    let recent = db::query_documents(
        pool,
        &DocQuery::new(collections::BOT_RESPONSES)
            .order_by("analyzedAt", SortOrder::Desc)
            .limit(RECENT_ANALYSES),
    )
    .await?;
    let pipeline = state.services.pipeline().await;
    Ok(Json(json!({
        "initialized": {
            "scanner": state.services.scanner().await.is_some(),
            "pipeline": pipeline.is_some(),
            "replier": pipeline.as_ref().map(|p| p.replier().can_post()).unwrap_or(false),
        },
        "model": pipeline.as_ref().map(|p| p.model_name().to_string()),
        "handled": db::count_handled(pool).await?,
        "replied": db::count_replied(pool).await?,
        "viralCandidates": db::count_documents(pool, collections::VIRAL_CANDIDATES).await?,
        "analyses": db::count_documents(pool, collections::BOT_RESPONSES).await?,
        "deadLetters": db::count_documents(pool, collections::DEAD_LETTERS).await?,
        "queueDepth": db::count_pending_messages(pool).await?,
        "budget": state.budget.status().await?,
        "recentAnalyses": recent.into_iter().map(|d| d.body).collect::<Vec<_>>(),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeThreadReq {
    #[serde(default)]
    tweet_url: Option<String>,
}

async fn analyze_thread(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: AnalyzeThreadReq = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))?;
    let url = req
        .tweet_url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("tweetUrl is required"))?;
    let post_id =
        parse_status_url(&url).ok_or_else(|| ApiError::bad_request("invalid tweet URL"))?;
    let pipeline = state
        .services
        .pipeline()
        .await
        .ok_or_else(|| ApiError::unavailable("analyzer"))?;

    let (candidate, analysis) = pipeline.analyze_post(&post_id).await.map_err(|err| match err {
        PlatformError::NotFound(_) => ApiError::bad_request(format!("post {post_id} not found")),
        other => {
            error!(?other, %post_id, "post lookup failed");
            ApiError::internal(other.to_string())
        }
    })?;
    info!(%post_id, degraded = analysis.is_degraded(), "manual analysis complete");
    Ok(Json(json!({
        "success": true,
        "candidateId": candidate.id,
        "analysis": analysis,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct StartMonitoringReq {
    #[serde(default)]
    keywords: Option<Vec<String>>,
}

async fn start_monitoring(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: StartMonitoringReq = if body.iter().all(u8::is_ascii_whitespace) {
        StartMonitoringReq::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))?
    };
    let keywords = match req.keywords {
        Some(k) if !k.is_empty() => {
            let k: Vec<String> = k
                .iter()
                .map(|w| w.trim())
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect();
            if k.is_empty() {
                return Err(ApiError::bad_request("keywords must not be blank"));
            }
            k
        }
        _ => state.keywords.as_ref().clone(),
    };
    let scanner = state
        .services
        .scanner()
        .await
        .ok_or_else(|| ApiError::unavailable("scanner"))?;
    let result = scanner.scan(keywords.as_slice()).await?;
    Ok(Json(json!({
        "success": true,
        "result": result,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// 204 acknowledges; 5xx asks the broker to redeliver; 400 for bodies that
/// will never decode.
async fn pubsub_push(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let (envelope, queued) = queue::decode_envelope(&body).map_err(|err| {
        warn!(%err, "rejecting malformed push envelope");
        ApiError::bad_request(err.to_string())
    })?;
    let pipeline = state
        .services
        .pipeline()
        .await
        .ok_or_else(|| ApiError::unavailable("analyzer"))?;
    info!(
        message_id = envelope.message.message_id.as_deref().unwrap_or("-"),
        candidate_id = %queued.id(),
        "push delivery"
    );
    pipeline.process(&queued).await?;
    Ok(StatusCode::NO_CONTENT)
}
