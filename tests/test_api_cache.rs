use serde_json::json;
use sipsync::{ApiClient, CacheKey, EventSource, FetchMode, ResponseCache, SyncError};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, freshness: Duration) -> ApiClient {
    let cache = Arc::new(ResponseCache::new(freshness));
    ApiClient::new(format!("{}/api", server.uri()), cache)
}

#[tokio::test]
async fn test_fresh_entry_served_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/42"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": 42, "currentWineNumber": 2}))
                .insert_header("ETag", "\"v1\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Duration::from_secs(60));
    let first = api.get("/events/42").await.unwrap();
    let second = api.get("/events/42").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second["currentWineNumber"], 2);
    assert!(api.last_success_ms() > 0);
}

#[tokio::test]
async fn test_stale_entry_revalidates_with_etag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/42"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/events/42"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": 42, "currentWineNumber": 3}))
                .insert_header("ETag", "\"v1\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    // zero window: every read is stale
    let api = client(&server, Duration::ZERO);
    let key = CacheKey::get("/events/42");

    let first = api.get("/events/42").await.unwrap();
    let fetched_at = api.cache().get(&key).unwrap().fetched_at_ms;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let second = api.get("/events/42").await.unwrap();
    let entry = api.cache().get(&key).unwrap();

    assert_eq!(first, second);
    assert_eq!(entry.payload["currentWineNumber"], 3);
    assert_eq!(entry.revalidation_token, "\"v1\"");
    assert!(entry.fetched_at_ms > fetched_at);
}

#[tokio::test]
async fn test_revalidate_mode_skips_fresh_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/42/wines/2/results"))
        .and(header_exists("If-None-Match"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"scores": [88]}))
                .insert_header("ETag", "\"r2\""),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/events/42/wines/2/results"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"scores": []}))
                .insert_header("ETag", "\"r1\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Duration::from_secs(60));
    let before = api.fetch_round("42", 2, FetchMode::Cached).await.unwrap();
    let cached = api.fetch_round("42", 2, FetchMode::Cached).await.unwrap();
    let after = api
        .fetch_round("42", 2, FetchMode::Revalidate)
        .await
        .unwrap();

    assert_eq!(before, cached);
    assert_eq!(after, json!({"scores": [88]}));
    let entry = api
        .cache()
        .get(&CacheKey::get("/events/42/wines/2/results"))
        .unwrap();
    assert_eq!(entry.revalidation_token, "\"r2\"");
}

#[tokio::test]
async fn test_failed_revalidation_keeps_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/42"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "maintenance"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/events/42"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": 42, "currentWineNumber": 5}))
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;

    let api = client(&server, Duration::ZERO);
    api.get("/events/42").await.unwrap();

    let err = api.get("/events/42").await.unwrap_err();
    assert!(matches!(
        &err,
        SyncError::Http { status: 503, message } if message == "maintenance"
    ));
    assert!(err.is_transient());

    let entry = api.cache().get(&CacheKey::get("/events/42")).unwrap();
    assert_eq!(entry.payload["currentWineNumber"], 5);
}

#[tokio::test]
async fn test_writes_bypass_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/events/42/scores"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
        .expect(2)
        .mount(&server)
        .await;

    let api = client(&server, Duration::from_secs(60));
    let body = json!({"wineNumber": 2, "score": 91});
    for _ in 0..2 {
        let response = api
            .request("/events/42/scores", reqwest::Method::POST, Some(&body))
            .await
            .unwrap();
        assert_eq!(response["ok"], true);
    }

    assert!(api.cache().is_empty());
}

#[tokio::test]
async fn test_error_message_from_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/404"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Event not found"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/events/500"))
        .respond_with(ResponseTemplate::new(500).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let api = client(&server, Duration::from_secs(60));

    let err = api.get("/events/404").await.unwrap_err();
    assert_eq!(err.to_string(), "HTTP 404: Event not found");
    assert!(!err.is_transient());

    let err = api.get("/events/500").await.unwrap_err();
    assert_eq!(err.to_string(), "HTTP 500: Internal Server Error");
}

#[tokio::test]
async fn test_fetch_event_parses_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 42,
            "currentWineNumber": 4,
            "currentWineUpdatedAt": "2025-03-01T19:04:11.200Z"
        })))
        .mount(&server)
        .await;

    let api = client(&server, Duration::from_secs(60));
    let snapshot = api.fetch_event("42", FetchMode::Cached).await.unwrap();

    assert_eq!(snapshot.event_id, "42");
    assert_eq!(snapshot.current_wine, 4);
    assert_eq!(snapshot.pointer_updated_at, Some(1_740_855_851_200));

    // a fresh hit reports when the original request went out
    let fetched_at = api.cache().get(&CacheKey::get("/events/42")).unwrap().fetched_at_ms;
    assert_eq!(snapshot.observed_at_ms, Some(fetched_at));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let again = api.fetch_event("42", FetchMode::Cached).await.unwrap();
    assert_eq!(again.observed_at_ms, Some(fetched_at));
}

#[tokio::test]
async fn test_bearer_token_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/1"))
        .and(header("Authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "currentWineNumber": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Duration::from_secs(60)).with_token("s3cret");
    api.get("/events/1").await.unwrap();
}
