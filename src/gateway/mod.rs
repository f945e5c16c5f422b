//! Gateway assembly.
//!
//! A [`Gateway`] builds every shared component once from a validated
//! [`GatewayConfig`] and hands the same instances to outbound clients and to
//! the inbound pipeline, so a response cached by the client is the one the
//! pipeline's monitor accounts for.
//!
//! Concurrency is the exception: inbound requests and outbound calls queue on
//! two different [`Throttler`]s. An endpoint that proxies through a client
//! already holds an inbound slot, and waiting for a second slot on the same
//! queue could starve it.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::CacheStore;
use crate::client::{ApiResponse, GatewayClient, Transport};
use crate::config::{ConfigError, GatewayConfig};
use crate::dedup::Deduplicator;
use crate::limiter::RateLimiter;
use crate::middleware::{CacheHeaderPolicy, Endpoint, Feature, LoggerMiddleware, Pipeline};
use crate::monitor::Monitor;
use crate::throttle::Throttler;
use crate::version::{VersionError, VersionNegotiator};

/// Reasons a [`Gateway`] cannot be built.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Version(#[from] VersionError),
}

/// The shared components of one gateway deployment.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use apigate::client::ReqwestTransport;
/// use apigate::config::GatewayConfig;
/// use apigate::context::Context;
/// use apigate::gateway::Gateway;
/// use apigate::middleware::endpoint;
/// use apigate::server::Server;
/// use apigate::{Response, StatusCode};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut gateway = Gateway::from_config(GatewayConfig::from_file("gateway.json")?)?;
/// gateway.spawn_maintenance();
///
/// let client = Arc::new(gateway.client(Arc::new(ReqwestTransport::new())));
/// let pipeline = gateway.pipeline(endpoint(move |_ctx: Context| {
///     let client = Arc::clone(&client);
///     async move {
///         match client.get("/news").await {
///             Ok(news) => Response::json(StatusCode::Ok, &news.body),
///             Err(e) => Response::error(StatusCode::BadGateway, "upstream", e.to_string()),
///         }
///     }
/// }));
///
/// Server::bind("0.0.0.0:8080").await?.serve(Arc::new(pipeline)).await?;
/// # Ok(())
/// # }
/// ```
pub struct Gateway {
    config: GatewayConfig,
    cache: Arc<CacheStore<ApiResponse>>,
    limiter: Arc<RateLimiter>,
    throttler: Arc<Throttler>,
    client_throttler: Arc<Throttler>,
    negotiator: Arc<VersionNegotiator>,
    monitor: Arc<Monitor>,
    dedup: Arc<Deduplicator<ApiResponse>>,
    maintenance: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Validates `config` and builds the shared components.
    ///
    /// No background task is started; see [`spawn_maintenance`](Self::spawn_maintenance).
    ///
    /// # Errors
    ///
    /// [`SetupError::Config`] listing every invalid field, or
    /// [`SetupError::Version`] if the version table is inconsistent.
    pub fn from_config(config: GatewayConfig) -> Result<Self, SetupError> {
        config.validate().map_err(ConfigError::from)?;

        let gateway = Self {
            cache: Arc::new(CacheStore::from_config(&config.cache)),
            limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            throttler: Arc::new(Throttler::from_config(&config.throttle)),
            client_throttler: Arc::new(Throttler::from_config(&config.client_throttle)),
            negotiator: Arc::new(VersionNegotiator::from_config(&config.versioning)?),
            monitor: Arc::new(Monitor::new()),
            dedup: Arc::new(Deduplicator::new(config.client.concurrent_limit)),
            maintenance: Vec::new(),
            config,
        };
        info!(
            current_version = %gateway.config.versioning.current,
            cache_enabled = gateway.config.cache.enabled,
            throttle_rules = gateway.config.throttle.rules.len(),
            "gateway configured"
        );
        Ok(gateway)
    }

    /// Starts the cache sweep and the rate-limiter cleanup. Calling it again
    /// is a no-op. The tasks stop when the gateway is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_maintenance(&mut self) {
        if !self.maintenance.is_empty() {
            return;
        }
        if self.config.cache.enabled {
            self.maintenance
                .push(self.cache.spawn_sweeper(self.config.cache.sweep_interval()));
        }
        self.maintenance.push(
            self.limiter
                .spawn_cleanup(self.config.rate_limit.cleanup_interval()),
        );
    }

    /// A client sharing this gateway's cache, deduplicator and monitor, and
    /// the outbound throttler built from `client_throttle`.
    pub fn client(&self, transport: Arc<dyn Transport>) -> GatewayClient {
        let client = GatewayClient::new(self.config.client.clone(), transport)
            .with_deduplicator(Arc::clone(&self.dedup))
            .with_monitor(Arc::clone(&self.monitor))
            .with_throttler(Arc::clone(&self.client_throttler));
        if self.config.cache.enabled {
            client.with_cache(Arc::clone(&self.cache))
        } else {
            client.without_cache()
        }
    }

    /// The standard inbound pipeline in front of `endpoint`.
    ///
    /// Stage order: request id, CORS, access log, monitoring, rate limiting,
    /// validation, versioning, throttling, compression, cache headers.
    /// Compression wraps the cache-header stage, so tags are computed over the
    /// identity body. They are weak while compression is enabled because the
    /// same tag then covers the gzip and identity representations.
    pub fn pipeline(&self, endpoint: Endpoint) -> Pipeline {
        let mut pipeline = Pipeline::new(endpoint);
        pipeline
            .enable_feature(Feature::Cors(self.config.cors.clone()))
            .add(LoggerMiddleware)
            .enable_feature(Feature::Monitoring(Arc::clone(&self.monitor)))
            .enable_feature(Feature::RateLimiting(Arc::clone(&self.limiter)))
            .enable_feature(Feature::Validation(self.config.validation.clone()))
            .enable_feature(Feature::Versioning(Arc::clone(&self.negotiator)))
            .enable_feature(Feature::Throttling(Arc::clone(&self.throttler)))
            .enable_feature(Feature::Compression(self.config.compression.clone()))
            .enable_feature(Feature::CacheHeaders(CacheHeaderPolicy {
                weak_etags: self.config.compression.enabled,
                ..CacheHeaderPolicy::default()
            }));
        pipeline
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore<ApiResponse>> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The inbound throttler used by [`pipeline`](Self::pipeline).
    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    /// The outbound throttler used by [`client`](Self::client).
    pub fn client_throttler(&self) -> &Arc<Throttler> {
        &self.client_throttler
    }

    pub fn negotiator(&self) -> &Arc<VersionNegotiator> {
        &self.negotiator
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn deduplicator(&self) -> &Arc<Deduplicator<ApiResponse>> {
        &self.dedup
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for task in &self.maintenance {
            task.abort();
        }
    }
}
