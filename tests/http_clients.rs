//! reqwest clients against wiremock servers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use reqwest::Url;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use threadripper::llm::{GeminiClient, ModelError, ReasoningModel};
use threadripper::model::{Candidate, EngagementMetrics, QueuedCandidate};
use threadripper::queue::{decode_data, PubSubPublisher, Publisher};
use threadripper::secrets::{GcpAuth, SecretError, SecretManagerSource, SecretSource};
use threadripper::twitter::{PlatformError, SocialPlatform, TwitterClient};

fn base(server: &MockServer) -> Url {
    Url::parse(&format!("{}/", server.uri())).unwrap()
}

fn twitter(server: &MockServer) -> TwitterClient {
    TwitterClient::with_base_url(Some("read-token".into()), Some("user-token".into()), base(server))
}

async fn metadata_auth(server: &MockServer) -> Arc<GcpAuth> {
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(header("Metadata-Flavor", "Google"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "gcp-token", "expires_in": 3599})),
        )
        .mount(server)
        .await;
    Arc::new(GcpAuth::with_metadata_url(
        base(server).join("token").unwrap(),
    ))
}

#[tokio::test]
async fn search_maps_tweets_to_candidates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/2/tweets/search/recent"))
        .and(query_param("max_results", "20"))
        .and(header("authorization", "Bearer read-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{
                "id": "T1",
                "text": "We just raised!",
                "author_id": "A1",
                "created_at": "2024-06-01T12:00:00.000Z",
                "public_metrics": {"like_count": 150, "reply_count": 45, "retweet_count": 23, "quote_count": 4}
            }],
            "meta": {"result_count": 1}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let found = twitter(&server)
        .search_recent("(startup) -is:retweet -is:reply lang:en", 20)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "T1");
    assert_eq!(found[0].author_id, "A1");
    assert_eq!(found[0].metrics, EngagementMetrics::new(150, 45, 23));
}

#[tokio::test]
async fn empty_search_has_no_data_field() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/2/tweets/search/recent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"meta": {"result_count": 0}})))
        .mount(&server)
        .await;

    let found = twitter(&server).search_recent("q", 10).await.unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn rate_limit_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/2/tweets/search/recent"))
        .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
        .mount(&server)
        .await;

    let err = twitter(&server).search_recent("q", 10).await.unwrap_err();
    assert!(matches!(err, PlatformError::RateLimited(_)));
}

#[tokio::test]
async fn replies_come_from_conversation_search() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/2/tweets/search/recent"))
        .and(query_param("query", "conversation_id:T1 is:reply"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "R1", "text": "congrats!"},
                {"id": "R2", "text": "what's the runway?"}
            ]
        })))
        .mount(&server)
        .await;

    let replies = twitter(&server).fetch_replies("T1", 10).await.unwrap();
    assert_eq!(replies, vec!["congrats!".to_string(), "what's the runway?".to_string()]);
}

#[tokio::test]
async fn post_reply_threads_under_parent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2/tweets"))
        .and(header("authorization", "Bearer user-token"))
        .and(body_partial_json(json!({"reply": {"in_reply_to_tweet_id": "T1"}})))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"data": {"id": "R9", "text": "hi"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let id = twitter(&server).post_reply("T1", "hi").await.unwrap();
    assert_eq!(id, "R9");
}

#[tokio::test]
async fn deleted_parent_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/2/tweets/404"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = twitter(&server).get_post("404").await.unwrap_err();
    assert!(matches!(err, PlatformError::NotFound(_)));
}

#[tokio::test]
async fn gemini_joins_candidate_parts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash-latest:generateContent"))
        .and(header("x-goog-api-key", "model-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "{\"a\":"}, {"text": " 1}"}]},
                "finishReason": "STOP"
            }]
        })))
        .mount(&server)
        .await;

    let client = GeminiClient::with_base_url("model-key", "gemini-1.5-flash-latest", base(&server));
    assert_eq!(client.generate("prompt").await.unwrap(), "{\"a\": 1}");
}

#[tokio::test]
async fn gemini_errors_surface_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let client = GeminiClient::with_base_url("k", "m", base(&server));
    let err = client.generate("prompt").await.unwrap_err();
    assert!(matches!(err, ModelError::Api { status: 503, .. }));
}

#[tokio::test]
async fn gemini_without_text_is_empty_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
        .mount(&server)
        .await;

    let client = GeminiClient::with_base_url("k", "m", base(&server));
    assert!(matches!(
        client.generate("prompt").await,
        Err(ModelError::EmptyResponse)
    ));
}

#[tokio::test]
async fn pubsub_publish_sends_encoded_candidate() {
    let server = MockServer::start().await;
    let auth = metadata_auth(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/projects/demo/topics/twitter-analyzer-new-thread:publish"))
        .and(header("authorization", "Bearer gcp-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messageIds": ["m-77"]})))
        .expect(1)
        .mount(&server)
        .await;

    let publisher =
        PubSubPublisher::new(base(&server), "demo", "twitter-analyzer-new-thread", auth);
    let queued = QueuedCandidate::new(
        Candidate {
            id: "T1".into(),
            text: "launch day".into(),
            author_id: "A1".into(),
            metrics: EngagementMetrics::new(150, 45, 23),
            created_at: Utc::now(),
        },
        24.9,
    );
    assert_eq!(publisher.publish(&queued).await.unwrap(), "m-77");

    let requests = server.received_requests().await.unwrap();
    let publish = requests
        .iter()
        .find(|r| r.url.path().ends_with(":publish"))
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&publish.body).unwrap();
    let data = body["messages"][0]["data"].as_str().unwrap();
    assert_eq!(decode_data(data).unwrap().candidate, queued.candidate);
    assert_eq!(body["messages"][0]["attributes"]["candidateId"], "T1");
}

#[tokio::test]
async fn secret_manager_decodes_payload() {
    let server = MockServer::start().await;
    let auth = metadata_auth(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/projects/demo/secrets/GEMINI_API_KEY/versions/latest:access"))
        .and(header("authorization", "Bearer gcp-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/demo/secrets/GEMINI_API_KEY/versions/3",
            "payload": {"data": BASE64.encode("model-key\n")}
        })))
        .mount(&server)
        .await;

    let source = SecretManagerSource::new(base(&server), "demo", auth);
    assert_eq!(source.fetch("GEMINI_API_KEY").await.unwrap(), "model-key");
}

#[tokio::test]
async fn missing_secret_is_not_found() {
    let server = MockServer::start().await;
    let auth = metadata_auth(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/projects/demo/secrets/NOPE/versions/latest:access"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let source = SecretManagerSource::new(base(&server), "demo", auth);
    assert!(matches!(
        source.fetch("NOPE").await,
        Err(SecretError::NotFound(_))
    ));
}
