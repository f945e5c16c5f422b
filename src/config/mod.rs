//! Gateway configuration: typed sections, defaults, overlay merge, validation.
//!
//! A [`GatewayConfig`] is assembled from defaults plus any number of
//! [`GatewayConfigOverlay`]s (typically parsed from a JSON file). Overlays
//! only carry the fields they want to change; nested sections are merged
//! field by field rather than replaced wholesale. [`GatewayConfig::validate`]
//! reports every violation at once.
//!
//! Durations are expressed in milliseconds on the wire (`ttl_ms`,
//! `window_ms`, ...) and exposed as [`Duration`] through accessors.
//!
//! ```
//! use apigate::config::GatewayConfig;
//!
//! let cfg = GatewayConfig::from_json_str(r#"{
//!     "cache": { "ttl_ms": 30000 },
//!     "rate_limit": { "max_requests": 50 }
//! }"#).unwrap();
//!
//! assert_eq!(cfg.cache.ttl().as_secs(), 30);
//! assert_eq!(cfg.cache.max_size, 1000);          // untouched default
//! assert_eq!(cfg.rate_limit.max_requests, 50);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::normalize_version;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigErrors),
}

/// A single rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    /// Dotted path of the offending field, e.g. `cache.ttl_ms`.
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found by [`GatewayConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {}", join_violations(.violations))]
pub struct ConfigErrors {
    pub violations: Vec<ConfigViolation>,
}

impl ConfigErrors {
    /// Returns `true` if some violation concerns `field`.
    pub fn mentions(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Sections ─────────────────────────────────────────────────────────────────

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Default time-to-live of an entry.
    pub ttl_ms: u64,
    /// Maximum number of entries before LRU eviction kicks in.
    pub max_size: usize,
    /// Interval of the proactive expiry sweep.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 5 * 60 * 1000,
            max_size: 1000,
            sweep_interval_ms: 60 * 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: usize,
    /// Interval at which identifiers with an empty window are dropped.
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60 * 1000,
            max_requests: 100,
            cleanup_interval_ms: 60 * 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Limits for one throttle pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRule {
    pub pattern: String,
    pub max_concurrent: usize,
    #[serde(default)]
    pub delay_ms: u64,
}

impl ThrottleRule {
    pub fn new(pattern: impl Into<String>, max_concurrent: usize, delay: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            max_concurrent,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Concurrency throttle settings: ordered rules plus a catch-all default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Limits of the queue used by endpoints no rule matches.
    pub default_max_concurrent: usize,
    pub default_delay_ms: u64,
    /// Checked in order; the first matching pattern wins.
    pub rules: Vec<ThrottleRule>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: 10,
            default_delay_ms: 0,
            rules: vec![
                ThrottleRule::new("/api/upload*", 2, Duration::ZERO),
                ThrottleRule::new("/api/search*", 5, Duration::from_millis(100)),
            ],
        }
    }
}

impl ThrottleConfig {
    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(self.default_delay_ms)
    }
}

/// Outbound client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix joined onto every endpoint that is not already an absolute URL.
    pub base_url: String,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Total number of attempts made for a transient failure.
    pub retry_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `retry_delay_ms * n` before retrying.
    pub retry_delay_ms: u64,
    /// Maximum number of distinct requests executing at once.
    pub concurrent_limit: usize,
    pub default_headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut default_headers = BTreeMap::new();
        default_headers.insert("Content-Type".to_owned(), "application/json".to_owned());
        default_headers.insert("Accept".to_owned(), "application/json".to_owned());
        Self {
            base_url: "http://localhost:8080".to_owned(),
            timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            concurrent_limit: 6,
            default_headers,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// A version flagged as deprecated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecationConfig {
    pub version: String,
    #[serde(default)]
    pub supported_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub migration_guide: Option<String>,
}

/// API versioning settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    pub current: String,
    pub supported: Vec<String>,
    pub deprecated: Vec<DeprecationConfig>,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            current: "v1".to_owned(),
            supported: vec!["v1".to_owned()],
            deprecated: Vec::new(),
        }
    }
}

/// Cross-origin settings for the CORS stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .map(str::to_owned)
                .to_vec(),
            allowed_headers: [
                "Content-Type",
                "Authorization",
                "X-Request-ID",
                "API-Version",
                "X-API-Version",
            ]
            .map(str::to_owned)
            .to_vec(),
        }
    }
}

/// Response compression settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Bodies smaller than this are sent uncompressed.
    pub min_size_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: 1024,
        }
    }
}

/// Inbound payload validation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_body_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    /// Inbound concurrency, applied by the pipeline's throttling stage.
    pub throttle: ThrottleConfig,
    pub client: ClientConfig,
    /// Outbound concurrency, applied per attempt by gateway clients. Kept
    /// apart from `throttle` so an endpoint holding an inbound slot never
    /// waits on its own queue for an outbound one.
    pub client_throttle: ThrottleConfig,
    pub versioning: VersioningConfig,
    pub cors: CorsConfig,
    pub compression: CompressionConfig,
    pub validation: ValidationConfig,
}

// ── Overlays ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfigOverlay {
    pub enabled: Option<bool>,
    pub ttl_ms: Option<u64>,
    pub max_size: Option<usize>,
    pub sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfigOverlay {
    pub window_ms: Option<u64>,
    pub max_requests: Option<usize>,
    pub cleanup_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfigOverlay {
    pub default_max_concurrent: Option<usize>,
    pub default_delay_ms: Option<u64>,
    /// Replaces the rule list when present; rule order is significant, so
    /// lists are never concatenated.
    pub rules: Option<Vec<ThrottleRule>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfigOverlay {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub concurrent_limit: Option<usize>,
    /// Merged key by key into the existing default headers.
    pub default_headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VersioningConfigOverlay {
    pub current: Option<String>,
    pub supported: Option<Vec<String>>,
    pub deprecated: Option<Vec<DeprecationConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfigOverlay {
    pub allowed_origins: Option<Vec<String>>,
    pub allowed_methods: Option<Vec<String>>,
    pub allowed_headers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressionConfigOverlay {
    pub enabled: Option<bool>,
    pub min_size_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfigOverlay {
    pub max_body_bytes: Option<usize>,
}

/// A partial configuration. Absent fields leave the base value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfigOverlay {
    pub cache: Option<CacheConfigOverlay>,
    pub rate_limit: Option<RateLimitConfigOverlay>,
    pub throttle: Option<ThrottleConfigOverlay>,
    pub client: Option<ClientConfigOverlay>,
    pub client_throttle: Option<ThrottleConfigOverlay>,
    pub versioning: Option<VersioningConfigOverlay>,
    pub cors: Option<CorsConfigOverlay>,
    pub compression: Option<CompressionConfigOverlay>,
    pub validation: Option<ValidationConfigOverlay>,
}

fn apply<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl GatewayConfig {
    /// Parses a (possibly partial) JSON document over the defaults and validates the result.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed JSON or unknown fields,
    /// [`ConfigError::Invalid`] when the merged result fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let overlay: GatewayConfigOverlay = serde_json::from_str(json)?;
        let config = Self::default().merge(overlay);
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file; see [`from_json_str`](Self::from_json_str).
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        tracing::info!(path = %path.display(), "gateway configuration loaded");
        Ok(config)
    }

    /// Applies `overlay` on top of `self`, field by field.
    #[must_use]
    pub fn merge(mut self, overlay: GatewayConfigOverlay) -> Self {
        if let Some(o) = overlay.cache {
            apply(&mut self.cache.enabled, o.enabled);
            apply(&mut self.cache.ttl_ms, o.ttl_ms);
            apply(&mut self.cache.max_size, o.max_size);
            apply(&mut self.cache.sweep_interval_ms, o.sweep_interval_ms);
        }
        if let Some(o) = overlay.rate_limit {
            apply(&mut self.rate_limit.window_ms, o.window_ms);
            apply(&mut self.rate_limit.max_requests, o.max_requests);
            apply(&mut self.rate_limit.cleanup_interval_ms, o.cleanup_interval_ms);
        }
        if let Some(o) = overlay.throttle {
            merge_throttle(&mut self.throttle, o);
        }
        if let Some(o) = overlay.client_throttle {
            merge_throttle(&mut self.client_throttle, o);
        }
        if let Some(o) = overlay.client {
            apply(&mut self.client.base_url, o.base_url);
            apply(&mut self.client.timeout_ms, o.timeout_ms);
            apply(&mut self.client.retry_attempts, o.retry_attempts);
            apply(&mut self.client.retry_delay_ms, o.retry_delay_ms);
            apply(&mut self.client.concurrent_limit, o.concurrent_limit);
            if let Some(headers) = o.default_headers {
                self.client.default_headers.extend(headers);
            }
        }
        if let Some(o) = overlay.versioning {
            apply(&mut self.versioning.current, o.current);
            apply(&mut self.versioning.supported, o.supported);
            apply(&mut self.versioning.deprecated, o.deprecated);
        }
        if let Some(o) = overlay.cors {
            apply(&mut self.cors.allowed_origins, o.allowed_origins);
            apply(&mut self.cors.allowed_methods, o.allowed_methods);
            apply(&mut self.cors.allowed_headers, o.allowed_headers);
        }
        if let Some(o) = overlay.compression {
            apply(&mut self.compression.enabled, o.enabled);
            apply(&mut self.compression.min_size_bytes, o.min_size_bytes);
        }
        if let Some(o) = overlay.validation {
            apply(&mut self.validation.max_body_bytes, o.max_body_bytes);
        }
        self
    }

    /// Checks every section and returns all violations together.
    ///
    /// # Errors
    ///
    /// [`ConfigErrors`] listing each rejected field.
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        let mut violations = Vec::new();
        let mut reject = |field: &'static str, message: String| {
            violations.push(ConfigViolation { field, message });
        };

        if self.cache.ttl_ms < 1000 {
            reject("cache.ttl_ms", format!("must be at least 1000, got {}", self.cache.ttl_ms));
        }
        if self.cache.max_size < 1 {
            reject("cache.max_size", "must be at least 1".to_owned());
        }
        if self.cache.sweep_interval_ms < 1 {
            reject("cache.sweep_interval_ms", "must be at least 1".to_owned());
        }
        if self.rate_limit.window_ms < 1 {
            reject("rate_limit.window_ms", "must be at least 1".to_owned());
        }
        if self.rate_limit.max_requests < 1 {
            reject("rate_limit.max_requests", "must be at least 1".to_owned());
        }
        if self.rate_limit.cleanup_interval_ms < 1 {
            reject("rate_limit.cleanup_interval_ms", "must be at least 1".to_owned());
        }
        check_throttle(
            &self.throttle,
            ("throttle.default_max_concurrent", "throttle.rules"),
            &mut reject,
        );
        check_throttle(
            &self.client_throttle,
            ("client_throttle.default_max_concurrent", "client_throttle.rules"),
            &mut reject,
        );
        if self.client.timeout_ms < 1 {
            reject("client.timeout_ms", "must be at least 1".to_owned());
        }
        if self.client.concurrent_limit < 1 {
            reject("client.concurrent_limit", "must be at least 1".to_owned());
        }
        if self.client.base_url.is_empty() {
            reject("client.base_url", "must not be empty".to_owned());
        }
        let supported: Vec<String> = self
            .versioning
            .supported
            .iter()
            .map(|v| normalize_version(v))
            .collect();
        let is_supported = |version: &str| supported.contains(&normalize_version(version));
        if supported.is_empty() {
            reject("versioning.supported", "must list at least one version".to_owned());
        } else if !is_supported(&self.versioning.current) {
            reject(
                "versioning.current",
                format!("`{}` is not a supported version", self.versioning.current),
            );
        }
        for deprecated in &self.versioning.deprecated {
            if !is_supported(&deprecated.version) {
                reject(
                    "versioning.deprecated",
                    format!("`{}` is not a supported version", deprecated.version),
                );
            }
        }
        for origin in &self.cors.allowed_origins {
            let well_formed = origin == "*"
                || origin.starts_with("http://")
                || origin.starts_with("https://");
            if !well_formed {
                reject("cors.allowed_origins", format!("malformed origin `{origin}`"));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigErrors { violations })
        }
    }
}

fn merge_throttle(section: &mut ThrottleConfig, overlay: ThrottleConfigOverlay) {
    apply(&mut section.default_max_concurrent, overlay.default_max_concurrent);
    apply(&mut section.default_delay_ms, overlay.default_delay_ms);
    apply(&mut section.rules, overlay.rules);
}

fn check_throttle(
    section: &ThrottleConfig,
    (default_field, rules_field): (&'static str, &'static str),
    reject: &mut impl FnMut(&'static str, String),
) {
    if section.default_max_concurrent < 1 {
        reject(default_field, "must be at least 1".to_owned());
    }
    for rule in &section.rules {
        if rule.pattern.is_empty() {
            reject(rules_field, "pattern must not be empty".to_owned());
        }
        if rule.max_concurrent < 1 {
            reject(
                rules_field,
                format!("max_concurrent of `{}` must be at least 1", rule.pattern),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn merge_touches_only_present_fields() {
        let overlay: GatewayConfigOverlay =
            serde_json::from_str(r#"{ "client": { "timeout_ms": 2500 } }"#).unwrap();
        let cfg = GatewayConfig::default().merge(overlay);
        assert_eq!(cfg.client.timeout_ms, 2500);
        assert_eq!(cfg.client.retry_attempts, 3);
        assert_eq!(cfg.cache, CacheConfig::default());
    }

    #[test]
    fn merge_extends_default_headers() {
        let overlay: GatewayConfigOverlay = serde_json::from_str(
            r#"{ "client": { "default_headers": { "Authorization": "Bearer t" } } }"#,
        )
        .unwrap();
        let cfg = GatewayConfig::default().merge(overlay);
        assert_eq!(
            cfg.client.default_headers.get("Authorization").map(String::as_str),
            Some("Bearer t")
        );
        assert!(cfg.client.default_headers.contains_key("Accept"));
    }

    #[test]
    fn merge_replaces_throttle_rules() {
        let overlay: GatewayConfigOverlay = serde_json::from_str(
            r#"{ "throttle": { "rules": [ { "pattern": "/slow*", "max_concurrent": 1 } ] } }"#,
        )
        .unwrap();
        let cfg = GatewayConfig::default().merge(overlay);
        assert_eq!(cfg.throttle.rules.len(), 1);
        assert_eq!(cfg.throttle.rules[0].delay(), Duration::ZERO);
    }

    #[test]
    fn validate_collects_every_violation() {
        let mut cfg = GatewayConfig::default();
        cfg.cache.ttl_ms = 500;
        cfg.rate_limit.max_requests = 0;
        cfg.versioning.supported.clear();
        cfg.cors.allowed_origins.push("example.com".to_owned());

        let err = cfg.validate().unwrap_err();
        assert_eq!(err.violations.len(), 4);
        assert!(err.mentions("cache.ttl_ms"));
        assert!(err.mentions("rate_limit.max_requests"));
        assert!(err.mentions("versioning.supported"));
        assert!(err.mentions("cors.allowed_origins"));
    }

    #[test]
    fn current_version_must_be_supported() {
        let mut cfg = GatewayConfig::default();
        cfg.versioning.current = "v9".to_owned();
        let err = cfg.validate().unwrap_err();
        assert!(err.mentions("versioning.current"));
    }

    #[test]
    fn version_spellings_are_compared_normalized() {
        let cfg = GatewayConfig::from_json_str(
            r#"{ "versioning": { "current": "2", "supported": ["v1", "V2"],
                 "deprecated": [ { "version": "1" } ] } }"#,
        )
        .unwrap();
        assert_eq!(cfg.versioning.current, "2");

        let mut cfg = GatewayConfig::default();
        cfg.versioning.current = "3".to_owned();
        assert!(cfg.validate().unwrap_err().mentions("versioning.current"));
    }

    #[test]
    fn client_throttle_is_merged_and_checked_separately() {
        let overlay: GatewayConfigOverlay = serde_json::from_str(
            r#"{ "client_throttle": { "default_max_concurrent": 0 } }"#,
        )
        .unwrap();
        let cfg = GatewayConfig::default().merge(overlay);
        assert_eq!(cfg.client_throttle.default_max_concurrent, 0);
        assert_eq!(cfg.throttle, ThrottleConfig::default());

        let err = cfg.validate().unwrap_err();
        assert!(err.mentions("client_throttle.default_max_concurrent"));
        assert!(!err.mentions("throttle.default_max_concurrent"));
    }

    #[test]
    fn from_json_str_rejects_invalid_result() {
        let err = GatewayConfig::from_json_str(r#"{ "cache": { "max_size": 0 } }"#).unwrap_err();
        match err {
            ConfigError::Invalid(errors) => assert!(errors.mentions("cache.max_size")),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn from_json_str_rejects_unknown_fields() {
        let err = GatewayConfig::from_json_str(r#"{ "cache": { "ttl": 5 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn from_file_reads_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{ "versioning": { "current": "v2", "supported": ["v1", "v2"] } }"#)
            .unwrap();
        let cfg = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(cfg.versioning.current, "v2");
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let err = GatewayConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
