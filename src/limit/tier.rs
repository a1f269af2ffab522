//! Route tier resolution.
//!
//! Maps a request path and method to the most specific configured tier,
//! falling back to the global default. Resolution is pure and reads only
//! an immutable table, so it needs no synchronization.

use http::Method;
use regex::Regex;

use super::policy::compile_wildcard;
use crate::config::{KeyType, MethodOverride, TierConfig, WindowParams};
use crate::error::Result;

/// Strip one trailing slash, except for the root path.
pub fn normalize_path(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

/// Limiting parameters resolved for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveLimit {
    pub window_ms: u64,
    pub max: u32,
    pub key_type: KeyType,
    /// The tier path that matched, if any. Used in the counter key so
    /// that distinct routes never share a bucket.
    pub route: Option<String>,
}

#[derive(Debug, Clone)]
enum TierPattern {
    Literal(String),
    Wildcard { regex: Regex, specificity: usize },
}

#[derive(Debug, Clone)]
struct Tier {
    pattern: TierPattern,
    config: TierConfig,
}

impl Tier {
    /// Per-method `exact_match` wins over the tier-level flag.
    fn exact_for(&self, method: &Method) -> bool {
        self.method_override(method)
            .and_then(|over| over.exact_match)
            .unwrap_or(self.config.exact_match)
    }

    fn method_override(&self, method: &Method) -> Option<&MethodOverride> {
        self.config
            .methods
            .iter()
            .find(|(name, _)| name.matches(method))
            .map(|(_, over)| over)
    }

    /// Whether this tier applies to `path`, and how specific the match
    /// is: `(length, exact)`.
    fn match_path(&self, path: &str, method: &Method) -> Option<(usize, bool)> {
        let exact = self.exact_for(method);
        match &self.pattern {
            TierPattern::Literal(key) => {
                if path == key {
                    Some((key.len(), exact))
                } else if !exact
                    && path.starts_with(key.as_str())
                    && path.as_bytes().get(key.len()) == Some(&b'/')
                {
                    Some((key.len(), false))
                } else if !exact && key == "/" {
                    // Root prefix covers every path.
                    Some((1, false))
                } else {
                    None
                }
            }
            TierPattern::Wildcard { regex, specificity } => {
                regex.is_match(path).then_some((*specificity, exact))
            }
        }
    }
}

/// Immutable, resolvable table of route tiers.
///
/// Built once from configuration (compiling any wildcard patterns) and
/// hot-swapped wholesale by administrative updates, never mutated in
/// place.
#[derive(Debug, Clone, Default)]
pub struct TierTable {
    tiers: Vec<Tier>,
}

impl TierTable {
    /// Build a table from configuration. Malformed patterns are
    /// configuration errors.
    pub fn new(configs: &[TierConfig]) -> Result<Self> {
        let mut tiers = Vec::with_capacity(configs.len());
        for config in configs {
            let pattern = if config.path.contains('*') {
                let normalized = normalize_path(&config.path);
                TierPattern::Wildcard {
                    regex: compile_wildcard(normalized)?,
                    specificity: normalized.chars().filter(|&c| c != '*').count(),
                }
            } else {
                TierPattern::Literal(normalize_path(&config.path).to_string())
            };
            tiers.push(Tier {
                pattern,
                config: config.clone(),
            });
        }
        Ok(Self { tiers })
    }

    /// Resolve the tier for `path` and `method`.
    ///
    /// Exact matches beat prefix matches, longer matches beat shorter
    /// ones, and among equals the earlier declaration wins. Unmatched
    /// paths get the global default.
    pub fn resolve(
        &self,
        path: &str,
        method: &Method,
        global: WindowParams,
        default_key_type: KeyType,
    ) -> EffectiveLimit {
        let path = normalize_path(path);

        let mut best: Option<(&Tier, usize, bool)> = None;
        for tier in &self.tiers {
            let Some((len, exact)) = tier.match_path(path, method) else {
                continue;
            };
            let improves = match best {
                None => true,
                Some((_, best_len, best_exact)) => {
                    (exact && !best_exact) || (exact == best_exact && len > best_len)
                }
            };
            if improves {
                best = Some((tier, len, exact));
            }
        }

        match best {
            None => EffectiveLimit {
                window_ms: global.window_ms,
                max: global.max,
                key_type: default_key_type,
                route: None,
            },
            Some((tier, _, _)) => {
                let over = tier.method_override(method);
                EffectiveLimit {
                    window_ms: over
                        .and_then(|o| o.window_ms)
                        .or(tier.config.window_ms)
                        .unwrap_or(global.window_ms),
                    max: over
                        .and_then(|o| o.max)
                        .or(tier.config.max)
                        .unwrap_or(global.max),
                    key_type: over
                        .and_then(|o| o.key_type)
                        .or(tier.config.key_type)
                        .unwrap_or(default_key_type),
                    route: Some(tier.config.path.clone()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MethodName;

    fn tier(path: &str) -> TierConfig {
        TierConfig {
            path: path.to_string(),
            ..TierConfig::default()
        }
    }

    fn global() -> WindowParams {
        WindowParams {
            window_ms: 60_000,
            max: 60,
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/b/"), "/a/b");
        assert_eq!(normalize_path("/a/b"), "/a/b");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_no_match_falls_back_to_global() {
        let table = TierTable::new(&[tier("/quotes")]).unwrap();
        let limit = table.resolve("/moods", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 60);
        assert_eq!(limit.route, None);
    }

    #[test]
    fn test_prefix_match_covers_subpaths() {
        let mut config = tier("/quotes");
        config.max = Some(5);
        let table = TierTable::new(&[config]).unwrap();

        let limit = table.resolve("/quotes/today", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 5);
        assert_eq!(limit.route.as_deref(), Some("/quotes"));

        // "/quotesx" shares the string prefix but not the path segment.
        let limit = table.resolve("/quotesx", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.route, None);
    }

    #[test]
    fn test_exact_match_excludes_subpaths() {
        let mut a = tier("/a");
        a.max = Some(1);
        let mut ab = tier("/a/b");
        ab.max = Some(5);
        ab.exact_match = true;
        let table = TierTable::new(&[a, ab]).unwrap();

        let limit = table.resolve("/a/b", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 5);

        // The exact tier does not apply to sub-paths; the prefix tier
        // catches them.
        let limit = table.resolve("/a/b/c", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 1);
    }

    #[test]
    fn test_exact_beats_prefix_at_same_path() {
        let mut prefix = tier("/a");
        prefix.max = Some(1);
        let mut exact = tier("/a");
        exact.max = Some(9);
        exact.exact_match = true;
        let table = TierTable::new(&[prefix, exact]).unwrap();

        let limit = table.resolve("/a", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 9);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut short = tier("/api");
        short.max = Some(100);
        let mut long = tier("/api/expensive");
        long.max = Some(2);
        let table = TierTable::new(&[short, long]).unwrap();

        let limit = table.resolve("/api/expensive/run", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 2);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let mut first = tier("/a");
        first.max = Some(1);
        let mut second = tier("/a");
        second.max = Some(2);
        let table = TierTable::new(&[first, second]).unwrap();

        let limit = table.resolve("/a", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 1);
    }

    #[test]
    fn test_trailing_slash_matches() {
        let mut config = tier("/quotes/");
        config.max = Some(5);
        let table = TierTable::new(&[config]).unwrap();

        let limit = table.resolve("/quotes", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 5);
    }

    #[test]
    fn test_method_override_takes_precedence() {
        let mut config = tier("/moods");
        config.max = Some(50);
        config.methods.insert(
            MethodName::Post,
            MethodOverride {
                max: Some(2),
                window_ms: Some(5_000),
                ..MethodOverride::default()
            },
        );
        let table = TierTable::new(&[config]).unwrap();

        let limit = table.resolve("/moods", &Method::POST, global(), KeyType::Ip);
        assert_eq!(limit.max, 2);
        assert_eq!(limit.window_ms, 5_000);

        // Methods without an override use the tier's base parameters.
        let limit = table.resolve("/moods", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 50);
        assert_eq!(limit.window_ms, 60_000);
    }

    #[test]
    fn test_tier_key_type_override() {
        let mut config = tier("/resources");
        config.key_type = Some(KeyType::ApiKey);
        let table = TierTable::new(&[config]).unwrap();

        let limit = table.resolve("/resources", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.key_type, KeyType::ApiKey);
    }

    #[test]
    fn test_wildcard_tier() {
        let mut config = tier("/api/*/export");
        config.max = Some(3);
        let table = TierTable::new(&[config]).unwrap();

        let limit = table.resolve("/api/v2/export", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 3);

        let limit = table.resolve("/api/v2/import", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.route, None);
    }

    #[test]
    fn test_wildcard_tier_trailing_slash_normalized() {
        let mut config = tier("/api/*/export/");
        config.max = Some(3);
        let table = TierTable::new(&[config]).unwrap();

        // The pattern is normalized like request paths are, so the
        // trailing slash cannot make it unmatchable.
        let limit = table.resolve("/api/v2/export", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 3);

        let limit = table.resolve("/api/v2/export/", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 3);
    }

    #[test]
    fn test_root_prefix_tier_covers_everything() {
        let mut config = tier("/");
        config.max = Some(7);
        let table = TierTable::new(&[config]).unwrap();

        let limit = table.resolve("/anything/at/all", &Method::GET, global(), KeyType::Ip);
        assert_eq!(limit.max, 7);
    }
}
