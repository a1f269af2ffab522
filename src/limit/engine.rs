//! The orchestrating admission engine.
//!
//! Invoked exactly once per request, before the protected handler:
//! resolves the route tier, applies policy bypasses, extracts the caller
//! identity, counts the request against the configured store, and
//! composes the decision. Store failures never escape: they are routed
//! through the configured fail-open/fail-closed policy.

use std::net::IpAddr;
use std::sync::Arc;

use http::{HeaderMap, Method};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::key::{extract_identity, CounterKey, Identity};
use super::policy::{BypassReason, PolicyState};
use super::response::{limit_headers, retry_after_secs, Decision, Rejection, RejectionBody};
use super::tier::normalize_path;
use crate::clock::{Clock, SystemClock};
use crate::config::{
    AdmissionConfig, Algorithm, HeaderConfig, StoreConfig, TierConfig, WindowParams,
};
use crate::error::{Result, TurnstileError};
use crate::store::{
    CounterStore, FixedWindowStore, RedisSlidingWindowStore, SlidingWindowStore, TokenBucketStore,
};

/// Everything the engine needs to know about an inbound request.
///
/// Identity and role are explicit inputs resolved earlier in the
/// pipeline rather than ambient lookups, so decisions are deterministic
/// under test.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Transport-level peer address.
    pub peer_addr: Option<IpAddr>,
    /// Caller role resolved by an upstream auth layer, e.g. `admin`.
    pub role: Option<String>,
    /// Caller id resolved by an upstream auth layer.
    pub id: Option<String>,
}

/// Extension points supplied by the embedding service.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Overrides all identity extraction when set.
    pub extract_key: Option<Arc<dyn Fn(&RequestDescriptor) -> Option<Identity> + Send + Sync>>,
    /// Identity resolution consulted before the built-in strategies.
    pub resolve_id: Option<Arc<dyn Fn(&RequestDescriptor) -> Option<Identity> + Send + Sync>>,
    /// Custom quota-rejection message; receives seconds until retry.
    pub limit_message: Option<Arc<dyn Fn(&RequestDescriptor, u64) -> String + Send + Sync>>,
    /// Custom blacklist-rejection message.
    pub blacklist_message: Option<Arc<dyn Fn(&RequestDescriptor) -> String + Send + Sync>>,
}

/// The request admission engine.
///
/// Thread-safe and shared across all in-flight requests. The policy
/// snapshot can be replaced by administrative calls while requests are
/// in flight; the counter store is fixed per deployment.
pub struct AdmissionEngine {
    store: Arc<dyn CounterStore>,
    policy: RwLock<Arc<PolicyState>>,
    headers: HeaderConfig,
    status_code: u16,
    api_key_header: String,
    hooks: Hooks,
    clock: Arc<dyn Clock>,
}

impl AdmissionEngine {
    /// Build an engine from configuration, constructing (and for Redis,
    /// connecting) the configured store.
    pub async fn from_config(config: AdmissionConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn CounterStore> = match &config.store {
            StoreConfig::Memory => match config.algorithm {
                Algorithm::FixedWindow => Arc::new(FixedWindowStore::new()),
                Algorithm::SlidingWindow => Arc::new(SlidingWindowStore::new()),
                Algorithm::TokenBucket => Arc::new(TokenBucketStore::new()),
            },
            StoreConfig::Redis { url } => Arc::new(
                RedisSlidingWindowStore::connect(url)
                    .await
                    .map_err(TurnstileError::Store)?,
            ),
        };
        Self::with_store(config, store)
    }

    /// Build an engine over a caller-supplied store: a custom backend,
    /// or a deterministic clock-controlled fake in tests.
    pub fn with_store(config: AdmissionConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        config.validate()?;
        let policy = PolicyState::from_config(&config)?;
        debug!(algorithm = ?config.algorithm, store = ?config.store, "Admission engine initialized");
        Ok(Self {
            store,
            policy: RwLock::new(Arc::new(policy)),
            headers: config.headers,
            status_code: config.status_code,
            api_key_header: config.api_key_header,
            hooks: Hooks::default(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Attach extension hooks.
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Decide whether to admit the request.
    pub async fn check(&self, req: &RequestDescriptor) -> Decision {
        let policy = self.policy.read().clone();

        // Skip patterns match the raw path as configured; tier resolution
        // and counter keys use the normalized form.
        if let Some(reason) = policy.bypass(req.role.as_deref(), &req.method, &req.path) {
            debug!(path = %req.path, reason = ?reason, "Skipping admission check");
            return Decision::Skip { reason };
        }

        let path = normalize_path(&req.path).to_string();

        let limit = policy
            .tiers
            .resolve(&path, &req.method, policy.global, policy.default_key_type);

        let Some(identity) =
            extract_identity(req, limit.key_type, &self.hooks, &self.api_key_header)
        else {
            debug!(path = %path, "No identity extracted, skipping admission check");
            return Decision::Skip {
                reason: BypassReason::NoIdentity,
            };
        };

        if policy.whitelist.contains(&identity) {
            debug!(identity = %identity, "Whitelisted identity admitted");
            return Decision::Skip {
                reason: BypassReason::Whitelisted,
            };
        }
        if policy.blacklist.contains(&identity) {
            // Blacklisted callers never consume or reset shared counters.
            debug!(identity = %identity, "Blacklisted identity rejected");
            return Decision::Reject(self.blacklisted(req));
        }

        let route = limit.route.clone().unwrap_or_else(|| path.clone());
        let key = CounterKey::new(limit.key_type, identity, route, &req.method);

        let admission = match self
            .store
            .incr(&key.to_string(), limit.window_ms, limit.max)
            .await
        {
            Ok(admission) => admission,
            Err(err) => {
                if policy.fail_open {
                    warn!(key = %key, error = %err, "Counter store unavailable, failing open");
                    return Decision::Skip {
                        reason: BypassReason::FailOpen,
                    };
                }
                warn!(key = %key, error = %err, "Counter store unavailable, failing closed");
                return Decision::Reject(Rejection {
                    status: 503,
                    headers: Vec::new(),
                    body: RejectionBody {
                        error: "RateLimitStoreUnavailable".to_string(),
                        message: "Rate limit backend unavailable. Please try again later."
                            .to_string(),
                        retry_after: None,
                    },
                });
            }
        };

        if admission.admitted {
            Decision::Admit {
                headers: limit_headers(&self.headers, limit.max, &admission, None),
            }
        } else {
            let retry_after = retry_after_secs(admission.reset_at_ms, self.clock.now_ms());
            debug!(
                key = %key,
                current = admission.current,
                max = limit.max,
                "Rate limit exceeded"
            );
            let message = match &self.hooks.limit_message {
                Some(hook) => hook(req, retry_after),
                None => format!("Rate limit exceeded. Try again in {retry_after} seconds."),
            };
            Decision::Reject(Rejection {
                status: self.status_code,
                headers: limit_headers(&self.headers, limit.max, &admission, Some(retry_after)),
                body: RejectionBody {
                    error: "Too Many Requests".to_string(),
                    message,
                    retry_after: Some(retry_after),
                },
            })
        }
    }

    fn blacklisted(&self, req: &RequestDescriptor) -> Rejection {
        let message = match &self.hooks.blacklist_message {
            Some(hook) => hook(req),
            None => "You are not allowed to access this resource.".to_string(),
        };
        Rejection {
            status: 403,
            headers: Vec::new(),
            body: RejectionBody {
                error: "Blacklisted".to_string(),
                message,
                retry_after: None,
            },
        }
    }

    /// Current policy snapshot.
    pub fn policy(&self) -> Arc<PolicyState> {
        self.policy.read().clone()
    }

    /// Replace the whole policy snapshot.
    pub fn set_policy(&self, policy: PolicyState) {
        *self.policy.write() = Arc::new(policy);
    }

    /// Replace the global default window and limit.
    pub fn set_global(&self, global: WindowParams) {
        self.swap(|next| next.global = global);
    }

    /// Replace the route tier table.
    pub fn set_tiers(&self, tiers: &[TierConfig]) -> Result<()> {
        let table = crate::limit::TierTable::new(tiers)?;
        self.swap(|next| next.tiers = table);
        Ok(())
    }

    /// Replace the whitelist.
    pub fn set_whitelist(&self, identities: Vec<String>) {
        self.swap(|next| next.whitelist = identities.into_iter().collect());
    }

    /// Replace the blacklist.
    pub fn set_blacklist(&self, identities: Vec<String>) {
        self.swap(|next| next.blacklist = identities.into_iter().collect());
    }

    /// Administrative reset: the next increment on `key` behaves as on a
    /// fresh key.
    pub async fn reset_key(&self, key: &str) -> Result<()> {
        self.store.reset_key(key).await.map_err(TurnstileError::Store)
    }

    /// Clone-and-swap one field of the policy snapshot. Readers see the
    /// old snapshot or the new one, never a mix.
    fn swap(&self, mutate: impl FnOnce(&mut PolicyState)) {
        let mut guard = self.policy.write();
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
