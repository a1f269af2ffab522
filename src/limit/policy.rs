//! Policy evaluation: bypasses, whitelist, blacklist, and skip paths.
//!
//! All policy inputs live in one immutable `PolicyState` snapshot that
//! administrative updates replace wholesale behind a single reference.
//! In-flight requests observe either the old or the new snapshot in
//! full, never a partial mix.

use std::collections::HashSet;

use regex::Regex;

use super::tier::TierTable;
use crate::config::{AdmissionConfig, KeyType, WindowParams};
use crate::error::{Result, TurnstileError};

/// Compile a literal-or-wildcard pattern to an anchored regex.
///
/// Regex metacharacters are escaped first, then `*` matches any run of
/// characters.
pub fn compile_wildcard(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    Regex::new(&format!("^{escaped}$"))
        .map_err(|e| TurnstileError::Config(format!("Invalid path pattern `{pattern}`: {e}")))
}

/// Matcher over the configured skip-path patterns.
#[derive(Debug, Clone, Default)]
pub struct SkipMatcher {
    patterns: Vec<Regex>,
}

impl SkipMatcher {
    /// Compile the skip patterns. Malformed patterns are configuration
    /// errors.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| compile_wildcard(pattern))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether `path` is exempt from limiting.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(path))
    }
}

/// Why a request bypassed the counting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Caller role is `admin` and admin bypass is enabled.
    AdminRole,
    /// Pre-flight method exempt by policy.
    Preflight,
    /// The engine is globally disabled.
    Disabled,
    /// The path matches a configured skip pattern.
    SkipPath,
    /// The identity is whitelisted.
    Whitelisted,
    /// No identity could be extracted for the caller.
    NoIdentity,
    /// The counter store failed and the fail-open policy admitted the
    /// request.
    FailOpen,
}

/// Process-wide, hot-swappable policy snapshot.
#[derive(Debug, Clone)]
pub struct PolicyState {
    /// Global default window and limit.
    pub global: WindowParams,
    /// Default identity strategy.
    pub default_key_type: KeyType,
    /// Route tier table.
    pub tiers: TierTable,
    /// Identities always admitted.
    pub whitelist: HashSet<String>,
    /// Identities always rejected without touching counters.
    pub blacklist: HashSet<String>,
    /// Paths exempt from limiting.
    pub skip: SkipMatcher,
    /// Admit when the counter store is unreachable.
    pub fail_open: bool,
    /// Skip limiting for `admin` callers.
    pub admin_bypass: bool,
    /// Engine globally disabled.
    pub disabled: bool,
}

impl PolicyState {
    /// Build the initial snapshot from configuration.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self> {
        Ok(Self {
            global: config.global,
            default_key_type: config.key_type,
            tiers: TierTable::new(&config.tiers)?,
            whitelist: config.whitelist.iter().cloned().collect(),
            blacklist: config.blacklist.iter().cloned().collect(),
            skip: SkipMatcher::new(&config.skip_paths)?,
            fail_open: config.fail_open,
            admin_bypass: config.admin_bypass,
            disabled: config.disabled,
        })
    }

    /// Pre-identity bypass checks, evaluated in fixed order with
    /// short-circuiting.
    pub fn bypass(
        &self,
        role: Option<&str>,
        method: &http::Method,
        path: &str,
    ) -> Option<BypassReason> {
        if self.admin_bypass && role == Some("admin") {
            return Some(BypassReason::AdminRole);
        }
        if method == http::Method::OPTIONS {
            return Some(BypassReason::Preflight);
        }
        if self.disabled {
            return Some(BypassReason::Disabled);
        }
        if self.skip.matches(path) {
            return Some(BypassReason::SkipPath);
        }
        None
    }
}
