//! Configuration surface for the admission engine.
//!
//! Loaded once at startup and validated before the engine is built.
//! Invalid windows, malformed tier patterns, and unsupported
//! algorithm/store pairings are load-time errors, never request-time
//! behavior.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::limit::compile_wildcard;

/// Which admission algorithm counts requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// One counter per window. Cheap, but admits up to `2 * max` across a
    /// window boundary.
    FixedWindow,
    /// Exact trailing-window log. `O(window size)` memory per key.
    #[default]
    SlidingWindow,
    /// Smooth sustained-rate admission without the fixed-window edge burst.
    TokenBucket,
}

/// Identity strategy used to bucket callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum KeyType {
    /// Forwarded-for header, real-IP header, or the transport peer address.
    #[default]
    Ip,
    /// A configured API key header.
    ApiKey,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ip => write!(f, "ip"),
            KeyType::ApiKey => write!(f, "apiKey"),
        }
    }
}

/// Where counter state lives. A static deployment choice, never
/// per-request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Per-process counters. Correct for single-instance deployments, or
    /// when per-instance rather than global quotas are acceptable.
    #[default]
    Memory,
    /// Shared Redis sorted-set counters, the only backend safe for
    /// horizontally scaled deployments.
    Redis { url: String },
}

/// A window/limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowParams {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Admitted requests per window. Zero always rejects.
    pub max: u32,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max: 60,
        }
    }
}

/// HTTP method names accepted in per-method tier overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MethodName {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Head,
}

impl MethodName {
    /// Whether this name refers to the given request method.
    pub fn matches(&self, method: &http::Method) -> bool {
        match self {
            MethodName::Get => method == http::Method::GET,
            MethodName::Post => method == http::Method::POST,
            MethodName::Put => method == http::Method::PUT,
            MethodName::Delete => method == http::Method::DELETE,
            MethodName::Patch => method == http::Method::PATCH,
            MethodName::Options => method == http::Method::OPTIONS,
            MethodName::Head => method == http::Method::HEAD,
        }
    }
}

/// Parameter overrides for a single method within a tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodOverride {
    pub window_ms: Option<u64>,
    pub max: Option<u32>,
    pub key_type: Option<KeyType>,
    pub exact_match: Option<bool>,
}

/// One route tier binding a path scope to limiting parameters.
///
/// A tier without per-method overrides applies its base parameters to
/// every method. Unset parameters inherit the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Literal path, or a pattern with `*` wildcards.
    pub path: String,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub max: Option<u32>,
    #[serde(default)]
    pub key_type: Option<KeyType>,
    /// Apply only on an exact path match instead of the path and its
    /// sub-paths.
    #[serde(default)]
    pub exact_match: bool,
    /// Per-method overrides, keyed by upper-case method name.
    #[serde(default)]
    pub methods: HashMap<MethodName, MethodOverride>,
}

/// Names of the informational response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderNames {
    pub limit: String,
    pub remaining: String,
    pub reset: String,
    pub retry_after: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            limit: "X-RateLimit-Limit".to_string(),
            remaining: "X-RateLimit-Remaining".to_string(),
            reset: "X-RateLimit-Reset".to_string(),
            retry_after: "Retry-After".to_string(),
        }
    }
}

/// Informational header emission. Disabling headers never changes the
/// admit/reject decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub enabled: bool,
    pub names: HeaderNames,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            names: HeaderNames::default(),
        }
    }
}

/// Complete configuration for the admission engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Global default window and limit.
    pub global: WindowParams,
    /// Default identity strategy.
    pub key_type: KeyType,
    /// Counting algorithm.
    pub algorithm: Algorithm,
    /// Counter storage backend.
    pub store: StoreConfig,
    /// Per-route tiers; the most specific match wins.
    pub tiers: Vec<TierConfig>,
    /// Identities always admitted.
    pub whitelist: Vec<String>,
    /// Identities always rejected, without touching counters.
    pub blacklist: Vec<String>,
    /// Paths exempt from limiting; `*` wildcards allowed.
    pub skip_paths: Vec<String>,
    /// Informational header emission.
    pub headers: HeaderConfig,
    /// Admit requests when the backing store is unreachable.
    pub fail_open: bool,
    /// Skip limiting for callers whose resolved role is `admin`.
    pub admin_bypass: bool,
    /// Disable the engine entirely. Intended for controlled test
    /// environments only.
    pub disabled: bool,
    /// Status code for quota rejections.
    pub status_code: u16,
    /// Header consulted by the `apiKey` identity strategy.
    pub api_key_header: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global: WindowParams::default(),
            key_type: KeyType::default(),
            algorithm: Algorithm::default(),
            store: StoreConfig::default(),
            tiers: Vec::new(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            skip_paths: Vec::new(),
            headers: HeaderConfig::default(),
            fail_open: true,
            admin_bypass: false,
            disabled: false,
            status_code: 429,
            api_key_header: "x-api-key".to_string(),
        }
    }
}

impl AdmissionConfig {
    /// Load and validate configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission control configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AdmissionConfig = serde_yaml::from_str(yaml).map_err(|e| {
            TurnstileError::Config(format!("Failed to parse admission config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make request-time behavior
    /// undefined.
    pub fn validate(&self) -> Result<()> {
        if self.global.window_ms == 0 {
            return Err(TurnstileError::Config(
                "global window_ms must be positive".to_string(),
            ));
        }

        for tier in &self.tiers {
            if tier.path.is_empty() {
                return Err(TurnstileError::Config(
                    "tier path must not be empty".to_string(),
                ));
            }
            if tier.window_ms == Some(0) {
                return Err(TurnstileError::Config(format!(
                    "tier `{}`: window_ms must be positive",
                    tier.path
                )));
            }
            for over in tier.methods.values() {
                if over.window_ms == Some(0) {
                    return Err(TurnstileError::Config(format!(
                        "tier `{}`: per-method window_ms must be positive",
                        tier.path
                    )));
                }
            }
            if tier.path.contains('*') {
                compile_wildcard(&tier.path)?;
            }
        }

        for pattern in &self.skip_paths {
            compile_wildcard(pattern)?;
        }

        if matches!(self.store, StoreConfig::Redis { .. })
            && self.algorithm != Algorithm::SlidingWindow
        {
            return Err(TurnstileError::Config(format!(
                "the redis store supports only the sliding-window algorithm, got {:?}",
                self.algorithm
            )));
        }

        if !(400..=599).contains(&self.status_code) {
            return Err(TurnstileError::Config(format!(
                "status_code must be a 4xx or 5xx code, got {}",
                self.status_code
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdmissionConfig::default();
        assert_eq!(config.global.window_ms, 60_000);
        assert_eq!(config.global.max, 60);
        assert_eq!(config.algorithm, Algorithm::SlidingWindow);
        assert_eq!(config.key_type, KeyType::Ip);
        assert_eq!(config.store, StoreConfig::Memory);
        assert!(config.fail_open);
        assert!(config.headers.enabled);
        assert_eq!(config.status_code, 429);
        assert_eq!(config.api_key_header, "x-api-key");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
global:
  window_ms: 1000
  max: 10
key_type: apiKey
algorithm: token-bucket
tiers:
  - path: /quotes
    max: 5
    exact_match: true
  - path: /moods
    methods:
      POST:
        window_ms: 5000
        max: 2
whitelist: ["10.0.0.1"]
blacklist: ["10.0.0.2"]
skip_paths: ["/health", "/docs/*"]
fail_open: false
admin_bypass: true
"#;
        let config = AdmissionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.global.max, 10);
        assert_eq!(config.key_type, KeyType::ApiKey);
        assert_eq!(config.algorithm, Algorithm::TokenBucket);
        assert_eq!(config.tiers.len(), 2);
        assert!(config.tiers[0].exact_match);
        let over = &config.tiers[1].methods[&MethodName::Post];
        assert_eq!(over.max, Some(2));
        assert_eq!(over.window_ms, Some(5000));
        assert!(!config.fail_open);
        assert!(config.admin_bypass);
    }

    #[test]
    fn test_parse_redis_store() {
        let yaml = r#"
store:
  backend: redis
  url: redis://127.0.0.1:6379
"#;
        let config = AdmissionConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Redis {
                url: "redis://127.0.0.1:6379".to_string()
            }
        );
    }

    #[test]
    fn test_zero_window_rejected() {
        let yaml = r#"
global:
  window_ms: 0
  max: 10
"#;
        assert!(AdmissionConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_tier_window_rejected() {
        let yaml = r#"
tiers:
  - path: /quotes
    window_ms: 0
"#;
        assert!(AdmissionConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_redis_requires_sliding_window() {
        let yaml = r#"
algorithm: fixed-window
store:
  backend: redis
  url: redis://127.0.0.1:6379
"#;
        let err = AdmissionConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("sliding-window"));
    }

    #[test]
    fn test_zero_max_is_valid_config() {
        // max = 0 is enforced at request time (always reject), not a
        // configuration error.
        let yaml = r#"
global:
  window_ms: 1000
  max: 0
"#;
        assert!(AdmissionConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_bad_status_code_rejected() {
        let yaml = "status_code: 200";
        assert!(AdmissionConfig::from_yaml(yaml).is_err());
    }
}
