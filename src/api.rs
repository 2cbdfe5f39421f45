use crate::cache::{CacheEntry, CacheKey, ResponseCache};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::sync::EventSource;
use crate::types::{now_ms, EventSnapshot};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::{Method, StatusCode};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a read treats a cache entry that is still fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Serve fresh entries without touching the network.
    #[default]
    Cached,
    /// Always ask the server; conditional when a token is known.
    Revalidate,
}

/// HTTP client for the tasting API.
///
/// Reads go through the shared [`ResponseCache`]; writes bypass it.
pub struct ApiClient {
    base_url: String,
    http_client: reqwest::Client,
    cache: Arc<ResponseCache>,
    api_token: Option<String>,
    last_success: Arc<AtomicI64>, // epoch millis
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, cache: Arc<ResponseCache>) -> Self {
        Self::with_timeout(base_url, cache, Duration::from_secs(10))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        cache: Arc<ResponseCache>,
        timeout: Duration,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            cache,
            api_token: None,
            last_success: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn from_config(config: &SyncConfig, cache: Arc<ResponseCache>) -> Self {
        let client = Self::with_timeout(&config.api_url, cache, config.request_timeout());
        match &config.api_token {
            Some(token) => client.with_token(token.clone()),
            None => client,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn last_success_ms(&self) -> i64 {
        self.last_success.load(Ordering::Relaxed)
    }

    /// Issue a request against `endpoint` (a path relative to the API base).
    ///
    /// GET/HEAD are answered from the cache while fresh and revalidated with
    /// `If-None-Match` once stale. Non-success statuses become
    /// [`SyncError::Http`]; a failed revalidation leaves the cached entry alone.
    pub async fn request(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let key = CacheKey::new(method.clone(), endpoint);
        if key.is_cacheable() {
            Ok(self.read(key, FetchMode::Cached).await?.payload)
        } else {
            self.write(endpoint, method, body).await
        }
    }

    pub async fn get(&self, endpoint: &str) -> Result<serde_json::Value> {
        self.request(endpoint, Method::GET, None).await
    }

    /// GET with an explicit cache policy.
    pub async fn fetch(&self, endpoint: &str, mode: FetchMode) -> Result<serde_json::Value> {
        Ok(self.fetch_entry(endpoint, mode).await?.payload)
    }

    /// Like [`fetch`](Self::fetch), but returns the cache entry that answered,
    /// so callers can tell how old the payload is.
    pub async fn fetch_entry(&self, endpoint: &str, mode: FetchMode) -> Result<CacheEntry> {
        self.read(CacheKey::get(endpoint), mode).await
    }

    async fn read(&self, key: CacheKey, mode: FetchMode) -> Result<CacheEntry> {
        if mode == FetchMode::Cached {
            if let Some(entry) = self.cache.get_fresh(&key, now_ms()) {
                tracing::debug!("[CACHE] fresh hit {} {}", key.method, key.path);
                return Ok(entry);
            }
        }

        let stale = self.cache.get(&key);
        let mut req = self.builder(key.method.clone(), &key.path);
        if let Some(entry) = &stale {
            if !entry.revalidation_token.is_empty() {
                req = req.header(IF_NONE_MATCH, entry.revalidation_token.as_str());
            }
        }

        let issued_at = now_ms();
        let response = req.send().await.map_err(|e| {
            SyncError::Network(format!("Failed to fetch {}: {}", key.path, e))
        })?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            self.mark_success();
            tracing::debug!("[CACHE] revalidated {} {}", key.method, key.path);
            return self.cache.touch(&key, issued_at).ok_or_else(|| {
                SyncError::InvalidPayload(format!(
                    "304 for {} without a cached entry",
                    key.path
                ))
            });
        }

        if !status.is_success() {
            tracing::warn!(
                "[CACHE] read {} failed with {} (cached entry kept: {})",
                key.path,
                status,
                stale.is_some()
            );
            return Err(error_from_response(status, response).await);
        }

        let token = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let payload = parse_body(response).await?;

        let entry = CacheEntry {
            payload,
            revalidation_token: token,
            fetched_at_ms: issued_at,
        };
        self.cache
            .put(key, entry.payload.clone(), entry.revalidation_token.clone(), issued_at);
        self.mark_success();
        Ok(entry)
    }

    async fn write(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut req = self.builder(method.clone(), endpoint);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| {
            SyncError::Network(format!("Failed to send {} {}: {}", method, endpoint, e))
        })?;
        let status = response.status();

        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }

        let payload = parse_body(response).await?;
        self.mark_success();
        Ok(payload)
    }

    fn builder(&self, method: Method, endpoint: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let req = self.http_client.request(method, &url);
        match &self.api_token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => req,
        }
    }

    fn mark_success(&self) {
        self.last_success.store(now_ms(), Ordering::Relaxed);
    }
}

async fn parse_body(response: reqwest::Response) -> Result<serde_json::Value> {
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Build a typed error, preferring the `error`/`message` field of a JSON
/// error body over the bare reason phrase.
async fn error_from_response(status: StatusCode, response: reqwest::Response) -> SyncError {
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());

    SyncError::Http {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl EventSource for ApiClient {
    async fn fetch_event(&self, event_id: &str, mode: FetchMode) -> Result<EventSnapshot> {
        let entry = self
            .fetch_entry(&format!("/events/{}", event_id), mode)
            .await?;
        Ok(EventSnapshot::from_json(&entry.payload)?.observed_at(entry.fetched_at_ms))
    }

    async fn fetch_round(
        &self,
        event_id: &str,
        wine_number: u32,
        mode: FetchMode,
    ) -> Result<serde_json::Value> {
        self.fetch(
            &format!("/events/{}/wines/{}/results", event_id, wine_number),
            mode,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(5)));
        let client = ApiClient::new("http://localhost:3001/api/", cache);

        assert_eq!(client.base_url(), "http://localhost:3001/api");
        assert_eq!(client.last_success_ms(), 0);
        assert!(client.cache().is_empty());
    }

    #[test]
    fn test_from_config_uses_token() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(5)));
        let config = SyncConfig {
            api_token: Some("secret".to_string()),
            ..SyncConfig::default()
        };
        let client = ApiClient::from_config(&config, cache);
        assert_eq!(client.api_token.as_deref(), Some("secret"));
        assert_eq!(client.base_url(), "http://127.0.0.1:3001/api");
    }
}
