//! API version negotiation.
//!
//! A [`VersionNegotiator`] knows every registered version, which of them are
//! deprecated and until when, and the version served when a request does not
//! ask for one. It reads the requested version from
//!
//! 1. the `API-Version` header, then
//! 2. the `X-API-Version` header, then
//! 3. the `Accept` header, either as a `version=` media-type parameter
//!    (`application/json; version=2`) or a vendor type
//!    (`application/vnd.acme.v2+json`),
//!
//! falling back to the current version. Version tokens are normalized to the
//! `v<N>` form, so `2`, `v2` and `V2` all name the same version.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::VersioningConfig;
use crate::http::Headers;

static ACCEPT_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i);\s*version\s*=\s*v?(\d+(?:\.\d+)*)").expect("static regex should not panic")
});

static VENDOR_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)application/vnd\.[a-z0-9.\-]+?\.v(\d+(?:\.\d+)*)\+json")
        .expect("static regex should not panic")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("version {0} is not registered")]
    Unregistered(String),
}

/// Everything known about one API version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub version: String,
    pub deprecated: bool,
    /// End of support for a deprecated version; `None` means no fixed date.
    pub supported_until: Option<DateTime<Utc>>,
    pub migration_guide: Option<String>,
}

impl VersionRecord {
    pub fn supported(version: &str) -> Self {
        Self {
            version: normalize_version(version),
            deprecated: false,
            supported_until: None,
            migration_guide: None,
        }
    }

    pub fn deprecated(
        version: &str,
        supported_until: Option<DateTime<Utc>>,
        migration_guide: Option<String>,
    ) -> Self {
        Self {
            version: normalize_version(version),
            deprecated: true,
            supported_until,
            migration_guide,
        }
    }

    /// Whether this version may still be served at `now`.
    pub fn is_supported_at(&self, now: DateTime<Utc>) -> bool {
        match (self.deprecated, self.supported_until) {
            (true, Some(until)) => now <= until,
            _ => true,
        }
    }
}

/// Registry of API versions plus the current default.
///
/// # Examples
///
/// ```
/// use apigate::http::Headers;
/// use apigate::version::{VersionNegotiator, VersionRecord};
///
/// let negotiator = VersionNegotiator::new("v2");
/// negotiator.register_version(VersionRecord::deprecated("v1", None, None));
///
/// let mut headers = Headers::new();
/// headers.insert("Accept", "application/vnd.news.v1+json");
/// assert_eq!(negotiator.parse_version_from_headers(&headers), "v1");
///
/// let response = negotiator.create_version_headers("v1");
/// assert_eq!(response.get("API-Version"), Some("v1"));
/// assert!(response.contains("Warning"));
/// ```
pub struct VersionNegotiator {
    versions: RwLock<BTreeMap<String, VersionRecord>>,
    current: RwLock<String>,
}

impl VersionNegotiator {
    /// Creates a negotiator with `current` registered as a supported version.
    pub fn new(current: &str) -> Self {
        let record = VersionRecord::supported(current);
        let current = record.version.clone();
        let mut versions = BTreeMap::new();
        versions.insert(current.clone(), record);
        Self {
            versions: RwLock::new(versions),
            current: RwLock::new(current),
        }
    }

    /// Registers every supported version of `config`, marks the deprecated
    /// ones and selects the configured current version.
    pub fn from_config(config: &VersioningConfig) -> Result<Self, VersionError> {
        let negotiator = Self::new(&config.current);
        for version in &config.supported {
            negotiator.register_version(VersionRecord::supported(version));
        }
        for deprecation in &config.deprecated {
            negotiator.register_version(VersionRecord::deprecated(
                &deprecation.version,
                deprecation.supported_until,
                deprecation.migration_guide.clone(),
            ));
        }
        negotiator.set_current_version(&config.current)?;
        Ok(negotiator)
    }

    /// Adds or replaces a version.
    pub fn register_version(&self, record: VersionRecord) {
        debug!(version = %record.version, deprecated = record.deprecated, "version registered");
        self.versions.write().insert(record.version.clone(), record);
    }

    /// Makes `version` the default for requests that do not ask for one.
    ///
    /// # Errors
    ///
    /// [`VersionError::Unregistered`] if `version` was never registered.
    pub fn set_current_version(&self, version: &str) -> Result<(), VersionError> {
        let version = normalize_version(version);
        if !self.versions.read().contains_key(&version) {
            return Err(VersionError::Unregistered(version));
        }
        info!(version = %version, "current API version set");
        *self.current.write() = version;
        Ok(())
    }

    pub fn current_version(&self) -> String {
        self.current.read().clone()
    }

    pub fn record(&self, version: &str) -> Option<VersionRecord> {
        self.versions.read().get(&normalize_version(version)).cloned()
    }

    /// `false` for unknown versions and for deprecated versions past their
    /// end of support.
    pub fn is_version_supported(&self, version: &str) -> bool {
        self.is_version_supported_at(version, Utc::now())
    }

    pub fn is_version_supported_at(&self, version: &str, now: DateTime<Utc>) -> bool {
        self.versions
            .read()
            .get(&normalize_version(version))
            .is_some_and(|record| record.is_supported_at(now))
    }

    /// Versions that can be served right now, in ascending order.
    pub fn supported_versions(&self) -> Vec<String> {
        let now = Utc::now();
        self.versions
            .read()
            .values()
            .filter(|record| record.is_supported_at(now))
            .map(|record| record.version.clone())
            .collect()
    }

    /// Resolves the version a request asks for, or the current version.
    pub fn parse_version_from_headers(&self, headers: &Headers) -> String {
        self.requested_version(headers)
            .unwrap_or_else(|| self.current_version())
    }

    /// The version a request explicitly asks for, if any.
    pub fn requested_version(&self, headers: &Headers) -> Option<String> {
        for name in ["API-Version", "X-API-Version"] {
            if let Some(value) = headers.get(name).map(str::trim).filter(|v| !v.is_empty()) {
                return Some(normalize_version(value));
            }
        }

        let accept = headers.get("Accept")?;
        ACCEPT_PARAM
            .captures(accept)
            .or_else(|| VENDOR_TYPE.captures(accept))
            .and_then(|caps| caps.get(1))
            .map(|m| normalize_version(m.as_str()))
    }

    /// Response headers announcing `version`, plus deprecation notices
    /// (`Warning`, `Sunset`, `Link`) when it is deprecated.
    pub fn create_version_headers(&self, version: &str) -> Headers {
        let version = normalize_version(version);
        let mut headers = Headers::new();
        headers.set("API-Version", version.as_str());
        headers.set("X-API-Version", version.as_str());

        let Some(record) = self.record(&version) else {
            return headers;
        };
        if record.deprecated {
            headers.set(
                "Warning",
                format!("299 - \"API version {version} is deprecated\""),
            );
            if let Some(until) = record.supported_until {
                headers.set("Sunset", http_date(until));
            }
            if let Some(guide) = &record.migration_guide {
                headers.set("Link", format!("<{guide}>; rel=\"deprecation\""));
            }
        }
        headers
    }
}

/// Canonical spelling of a version token: `2`, `v2` and `V2` all become `v2`.
pub fn normalize_version(version: &str) -> String {
    let version = version.trim();
    match version.strip_prefix(['v', 'V']) {
        Some(rest) => format!("v{rest}"),
        None => format!("v{version}"),
    }
}

// IMF-fixdate, as used by `Sunset`.
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeprecationConfig;
    use chrono::TimeZone;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().copied().collect()
    }

    #[test]
    fn explicit_header_wins() {
        let negotiator = VersionNegotiator::new("v2");
        let h = headers(&[
            ("API-Version", "1"),
            ("X-API-Version", "v3"),
            ("Accept", "application/json; version=4"),
        ]);
        assert_eq!(negotiator.parse_version_from_headers(&h), "v1");

        let h = headers(&[("x-api-version", "V3"), ("Accept", "application/json; version=4")]);
        assert_eq!(negotiator.parse_version_from_headers(&h), "v3");
    }

    #[test]
    fn accept_header_forms() {
        let negotiator = VersionNegotiator::new("v2");
        let param = headers(&[("Accept", "application/json; version=4")]);
        assert_eq!(negotiator.parse_version_from_headers(&param), "v4");

        let vendor = headers(&[("Accept", "application/vnd.acme.news.v5+json")]);
        assert_eq!(negotiator.parse_version_from_headers(&vendor), "v5");
    }

    #[test]
    fn falls_back_to_current() {
        let negotiator = VersionNegotiator::new("v2");
        assert_eq!(negotiator.parse_version_from_headers(&Headers::new()), "v2");
        let plain = headers(&[("Accept", "application/json")]);
        assert_eq!(negotiator.parse_version_from_headers(&plain), "v2");
        assert_eq!(negotiator.requested_version(&plain), None);
    }

    #[test]
    fn deprecated_version_expires() {
        let negotiator = VersionNegotiator::new("v2");
        let until = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        negotiator.register_version(VersionRecord::deprecated("v1", Some(until), None));

        let before = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        assert!(negotiator.is_version_supported_at("v1", before));
        assert!(!negotiator.is_version_supported_at("v1", after));
        assert!(!negotiator.is_version_supported("v9"));
        assert!(negotiator.is_version_supported("2"));
    }

    #[test]
    fn deprecation_headers() {
        let negotiator = VersionNegotiator::new("v2");
        let until = Utc.with_ymd_and_hms(2030, 1, 15, 0, 0, 0).unwrap();
        negotiator.register_version(VersionRecord::deprecated(
            "v1",
            Some(until),
            Some("https://docs.example.com/migrate".to_owned()),
        ));

        let h = negotiator.create_version_headers("v1");
        assert_eq!(h.get("API-Version"), Some("v1"));
        assert_eq!(h.get("X-API-Version"), Some("v1"));
        assert_eq!(h.get("Sunset"), Some("Tue, 15 Jan 2030 00:00:00 GMT"));
        assert_eq!(
            h.get("Link"),
            Some("<https://docs.example.com/migrate>; rel=\"deprecation\"")
        );
        assert!(h.get("Warning").unwrap().contains("deprecated"));

        let current = negotiator.create_version_headers("v2");
        assert_eq!(current.len(), 2);
    }

    #[test]
    fn current_version_must_be_registered() {
        let negotiator = VersionNegotiator::new("v1");
        assert_eq!(
            negotiator.set_current_version("v2"),
            Err(VersionError::Unregistered("v2".to_owned()))
        );
        negotiator.register_version(VersionRecord::supported("v2"));
        negotiator.set_current_version("v2").unwrap();
        assert_eq!(negotiator.current_version(), "v2");
    }

    #[test]
    fn from_config_marks_deprecations() {
        let config = VersioningConfig {
            current: "v2".to_owned(),
            supported: vec!["v1".to_owned(), "v2".to_owned()],
            deprecated: vec![DeprecationConfig {
                version: "v1".to_owned(),
                supported_until: None,
                migration_guide: None,
            }],
        };
        let negotiator = VersionNegotiator::from_config(&config).unwrap();
        assert_eq!(negotiator.current_version(), "v2");
        assert!(negotiator.record("v1").unwrap().deprecated);
        assert_eq!(negotiator.supported_versions(), vec!["v1", "v2"]);
    }

    #[test]
    fn from_config_accepts_mixed_spellings() {
        let config = VersioningConfig {
            current: "2".to_owned(),
            supported: vec!["V2".to_owned()],
            deprecated: Vec::new(),
        };
        let negotiator = VersionNegotiator::from_config(&config).unwrap();
        assert_eq!(negotiator.current_version(), "v2");
        assert_eq!(normalize_version(" V3 "), "v3");
    }
}
