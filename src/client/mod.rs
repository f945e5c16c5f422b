//! Outbound API client.
//!
//! [`GatewayClient::request`] is the single path every call takes:
//!
//! 1. cacheable reads (`GET` with caching left on) are answered from the
//!    [`CacheStore`] when a live entry exists;
//! 2. otherwise the call is keyed by method, URL, body and headers and handed
//!    to the [`Deduplicator`], so identical concurrent calls share one
//!    exchange;
//! 3. each attempt of that exchange passes the optional client-side rate
//!    limiter and throttle queue, then the transport under a timeout;
//!    transient failures are retried with a linear backoff;
//! 4. successful reads are cached with their validators, successful writes
//!    invalidate cached reads of the touched collection, and the outcome is
//!    recorded in the [`Monitor`].

mod error;
mod transport;

pub use error::GatewayError;
pub use transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheStore, Freshness};
use crate::config::{CacheConfig, ClientConfig};
use crate::dedup::Deduplicator;
use crate::http::{Headers, Method};
use crate::limiter::RateLimiter;
use crate::monitor::Monitor;
use crate::throttle::Throttler;

/// A decoded upstream answer.
///
/// JSON bodies are parsed; other non-empty bodies are kept as a JSON string
/// and empty bodies become `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Value,
}

impl ApiResponse {
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("ETag")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("Last-Modified")
    }

    /// Deserializes the body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    fn freshness(&self) -> Freshness {
        Freshness::new(
            self.etag().map(str::to_owned),
            self.last_modified().map(str::to_owned),
        )
    }
}

/// Per-call settings for [`GatewayClient::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    /// Sent on top of the configured default headers.
    pub headers: Headers,
    /// Consult and fill the cache for `GET` calls.
    pub use_cache: bool,
    /// Overrides the cache's default TTL for this response.
    pub cache_ttl: Option<Duration>,
    /// Send the cached entry's validators and accept `304 Not Modified`.
    pub revalidate: bool,
    /// Position in the throttle queue; higher goes first.
    pub priority: i32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::Get,
            body: None,
            headers: Headers::new(),
            use_cache: true,
            cache_ttl: None,
            revalidate: false,
            priority: 0,
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn revalidate(mut self) -> Self {
        self.revalidate = true;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Client for a JSON API behind the gateway's caching, deduplication,
/// throttling and retry policies.
///
/// The shared components are injected, so several clients (or a client and
/// the inbound pipeline) can use the same cache, throttler and monitor.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use apigate::client::{GatewayClient, ReqwestTransport};
/// use apigate::config::ClientConfig;
///
/// # async fn run() -> Result<(), apigate::client::GatewayError> {
/// let client = GatewayClient::new(ClientConfig::default(), Arc::new(ReqwestTransport::new()));
/// let story = client.get("/news/42").await?;
/// println!("{}", story.body["title"]);
/// # Ok(())
/// # }
/// ```
pub struct GatewayClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    cache: Option<Arc<CacheStore<ApiResponse>>>,
    dedup: Arc<Deduplicator<ApiResponse>>,
    monitor: Arc<Monitor>,
    throttler: Option<Arc<Throttler>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl GatewayClient {
    /// Creates a client with a private default cache, deduplicator and
    /// monitor, and no throttling or client-side rate limiting.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            cache: Some(Arc::new(CacheStore::from_config(&CacheConfig::default()))),
            dedup: Arc::new(Deduplicator::new(config.concurrent_limit)),
            monitor: Arc::new(Monitor::new()),
            throttler: None,
            limiter: None,
            config,
            transport,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheStore<ApiResponse>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Disables response caching entirely.
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    #[must_use]
    pub fn with_deduplicator(mut self, dedup: Arc<Deduplicator<ApiResponse>>) -> Self {
        self.dedup = dedup;
        self
    }

    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Runs every attempt inside the throttle queue matching its path.
    #[must_use]
    pub fn with_throttler(mut self, throttler: Arc<Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Counts every attempt against `limiter`, keyed by request path.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<CacheStore<ApiResponse>>> {
        self.cache.as_ref()
    }

    pub fn deduplicator(&self) -> &Arc<Deduplicator<ApiResponse>> {
        &self.dedup
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub async fn get(&self, endpoint: &str) -> Result<ApiResponse, GatewayError> {
        self.request(endpoint, RequestOptions::new(Method::Get)).await
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> Result<ApiResponse, GatewayError> {
        self.request(endpoint, RequestOptions::new(Method::Post).with_body(body))
            .await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> Result<ApiResponse, GatewayError> {
        self.request(endpoint, RequestOptions::new(Method::Put).with_body(body))
            .await
    }

    pub async fn patch(&self, endpoint: &str, body: Value) -> Result<ApiResponse, GatewayError> {
        self.request(endpoint, RequestOptions::new(Method::Patch).with_body(body))
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<ApiResponse, GatewayError> {
        self.request(endpoint, RequestOptions::new(Method::Delete)).await
    }

    /// `GET` and deserialize the body into `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, GatewayError> {
        self.get(endpoint).await?.json()
    }

    /// `POST` a serializable body and deserialize the answer into `T`.
    pub async fn post_json<B, T>(&self, endpoint: &str, body: &B) -> Result<T, GatewayError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body =
            serde_json::to_value(body).map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        self.post(endpoint, body).await?.json()
    }

    /// Performs one logical call; see the module docs for the steps.
    ///
    /// `endpoint` is either a path relative to the configured base URL or an
    /// absolute `http(s)://` URL.
    pub async fn request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, GatewayError> {
        let start = Instant::now();
        let label = format!("{} {}", options.method, url_path(endpoint));
        let result = self.dispatch(endpoint, options).await;
        self.monitor.record(&label, start.elapsed(), result.is_ok());
        result
    }

    async fn dispatch(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, GatewayError> {
        let url = self.resolve_url(endpoint)?;
        let mut headers: Headers = self.config.default_headers.iter().collect();
        headers.merge(&options.headers);
        let body = options.body.as_ref().map(Value::to_string);
        let key = request_key(&options.method, &url, body.as_deref(), &headers);

        let cache = self
            .cache
            .as_ref()
            .filter(|_| options.method == Method::Get && options.use_cache);

        let mut revalidating: Option<CacheEntry<ApiResponse>> = None;
        if let Some(cache) = cache {
            if options.revalidate {
                revalidating = cache.get_entry(&key);
                if let Some(entry) = &revalidating {
                    if let Some(etag) = &entry.etag {
                        headers.set("If-None-Match", etag.as_str());
                    }
                    if let Some(last_modified) = &entry.last_modified {
                        headers.set("If-Modified-Since", last_modified.as_str());
                    }
                }
            } else if let Some(hit) = cache.get(&key) {
                return Ok(hit);
            }
        }
        headers.set("X-Request-ID", Uuid::new_v4().to_string());

        let exchange = Exchange {
            transport: Arc::clone(&self.transport),
            request: TransportRequest {
                method: options.method.clone(),
                url: url.clone(),
                headers,
                body: body.map(Bytes::from),
            },
            path: url_path(&url).to_owned(),
            priority: options.priority,
            throttler: self.throttler.clone(),
            limiter: self.limiter.clone(),
            timeout: self.config.timeout(),
            attempts: self.config.retry_attempts.max(1),
            retry_delay: self.config.retry_delay(),
        };
        let response = self.dedup.enqueue(&key, exchange.run()).await?;

        if response.status == 304 {
            let entry = revalidating.or_else(|| cache.and_then(|c| c.get_entry(&key)));
            return match (entry, cache) {
                (Some(entry), Some(cache)) => {
                    if !cache.refresh(&key) {
                        cache.set(
                            &key,
                            entry.value.clone(),
                            Some(entry.ttl),
                            Freshness::new(entry.etag.clone(), entry.last_modified.clone()),
                        );
                    }
                    debug!(url = %url, "cached response revalidated");
                    Ok(entry.value)
                }
                _ => Err(GatewayError::Status {
                    status: 304,
                    body: response.body,
                }),
            };
        }

        if let Some(cache) = cache {
            cache.set(&key, response.clone(), options.cache_ttl, response.freshness());
        }
        if options.method.is_mutating() {
            self.invalidate_collection(&options.method, &url);
        }
        Ok(response)
    }

    fn resolve_url(&self, endpoint: &str) -> Result<String, GatewayError> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(endpoint.to_owned());
        }
        let base = self.config.base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "relative endpoint {endpoint} without a base URL"
            )));
        }
        Ok(format!("{base}/{}", endpoint.trim_start_matches('/')))
    }

    // `POST /news` touches `/news`; `PUT /news/42` touches `/news` as well.
    fn invalidate_collection(&self, method: &Method, url: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        let resource = url.split(['?', '#']).next().unwrap_or(url);
        let collection = match method {
            Method::Post => resource.trim_end_matches('/'),
            _ => resource
                .trim_end_matches('/')
                .rsplit_once('/')
                .map_or(resource, |(parent, _)| parent),
        };

        let removed: usize = [":", "/", "?"]
            .iter()
            .map(|sep| cache.invalidate(&format!("GET:{collection}{sep}*")))
            .sum();
        debug!(collection, removed, "cached reads invalidated after write");
    }
}

/// Deterministic signature of a call: `METHOD:url:body:headers`, headers in
/// canonical (lowercase, sorted) JSON form.
fn request_key(method: &Method, url: &str, body: Option<&str>, headers: &Headers) -> String {
    let headers = serde_json::to_string(&headers.canonical()).unwrap_or_default();
    format!("{method}:{url}:{}:{headers}", body.unwrap_or(""))
}

/// Path component of a relative endpoint or absolute URL, without query.
fn url_path(target: &str) -> &str {
    let without_scheme = target
        .split_once("://")
        .map_or(target, |(_, rest)| rest.find('/').map_or("/", |i| &rest[i..]));
    without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme)
}

/// One deduplicated exchange with its retry policy. Owns everything it needs
/// so it can run on its own task.
struct Exchange {
    transport: Arc<dyn Transport>,
    request: TransportRequest,
    path: String,
    priority: i32,
    throttler: Option<Arc<Throttler>>,
    limiter: Option<Arc<RateLimiter>>,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl Exchange {
    async fn run(self) -> Result<ApiResponse, GatewayError> {
        let mut attempt = 1;
        loop {
            match self.attempt().await {
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    let backoff = self.retry_delay * attempt;
                    warn!(
                        url = %self.request.url,
                        attempt,
                        ?backoff,
                        error = %e,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn attempt(&self) -> Result<ApiResponse, GatewayError> {
        if let Some(limiter) = &self.limiter {
            let decision = limiter.is_allowed(&self.path);
            if !decision.allowed {
                return Err(GatewayError::RateLimited {
                    reset_in: decision.reset_in,
                });
            }
        }

        let send = async {
            let raw = tokio::time::timeout(self.timeout, self.transport.send(self.request.clone()))
                .await
                .map_err(|_| GatewayError::Timeout(self.timeout))??;
            decode(raw)
        };
        match &self.throttler {
            Some(throttler) => {
                throttler
                    .throttle_with_priority(&self.path, send, self.priority)
                    .await
            }
            None => send.await,
        }
    }
}

fn decode(raw: TransportResponse) -> Result<ApiResponse, GatewayError> {
    let succeeded = (200..300).contains(&raw.status) || raw.status == 304;
    let body = match parse_body(&raw.headers, &raw.body) {
        Ok(body) => body,
        Err(e) if succeeded => return Err(e),
        Err(_) => Value::String(String::from_utf8_lossy(&raw.body).into_owned()),
    };

    if succeeded {
        Ok(ApiResponse {
            status: raw.status,
            headers: raw.headers,
            body,
        })
    } else {
        Err(GatewayError::Status {
            status: raw.status,
            body,
        })
    }
}

fn parse_body(headers: &Headers, body: &[u8]) -> Result<Value, GatewayError> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_slice(body) {
        Ok(value) => Ok(value),
        Err(e) => {
            let declared_json = headers
                .get("Content-Type")
                .is_some_and(|ct| ct.contains("json"));
            if declared_json {
                Err(e.into())
            } else {
                Ok(Value::String(String::from_utf8_lossy(body).into_owned()))
            }
        }
    }
}
