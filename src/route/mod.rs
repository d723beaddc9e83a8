//! Maps (host, path, method) to a backend and a rewritten upstream path.
//!
//! Grounded on the teacher's `proxy::router` module: an `ArcSwap`-held match
//! table rebuilt wholesale on config reload, plus the reversed-host trick
//! generalized here into direct wildcard-label regexes since route matching
//! here needs label-wildcard and prefix semantics rather than matchit's
//! exact-segment routing.

use std::collections::HashSet;
use std::sync::Mutex;

use arc_swap::ArcSwap;
use lru::LruCache;
use regex::Regex;

use crate::config::{Config, Fallback, RouteRule};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDecision {
    pub backend_host: String,
    pub use_tls: bool,
    pub upstream_path: String,
    pub matched: bool,
    pub fallback_used: bool,
    pub applied_rule: Option<String>,
}

impl RouteDecision {
    fn unmatched(backend_host: String, use_tls: bool, path: String) -> Self {
        Self {
            backend_host,
            use_tls,
            upstream_path: path,
            matched: false,
            fallback_used: false,
            applied_rule: None,
        }
    }
}

enum HostMatcher {
    Exact(String),
    Wildcard(Regex),
}

impl HostMatcher {
    fn compile(pattern: &str) -> Self {
        if let Some(rest) = pattern.strip_prefix("*.") {
            let escaped = regex::escape(rest);
            let re = Regex::new(&format!(r"^[^.]+\.{escaped}$")).expect("wildcard domain pattern");
            HostMatcher::Wildcard(re)
        } else {
            HostMatcher::Exact(pattern.to_string())
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostMatcher::Exact(p) => p == host,
            HostMatcher::Wildcard(re) => re.is_match(host),
        }
    }
}

enum PathMatcher {
    Regex(Regex),
    Prefix(String),
}

struct CompiledInnerRule {
    methods: Option<HashSet<String>>,
    matcher: PathMatcher,
    replacement: String,
    stop: bool,
}

struct CompiledRule {
    id: String,
    host: HostMatcher,
    backend_host: String,
    use_tls: bool,
    path_prefix: Option<String>,
    inner_rules: Vec<CompiledInnerRule>,
    fallback: Fallback,
}

struct RouteTable {
    rules: Vec<CompiledRule>,
    origin_domains: HashSet<String>,
    default_backend_host: String,
    default_use_tls: bool,
}

impl RouteTable {
    fn build(config: &Config) -> Self {
        let mut origin_domains = HashSet::new();
        let rules = config
            .routes
            .iter()
            .map(|r| compile_rule(r))
            .collect::<Vec<_>>();
        for r in &config.routes {
            origin_domains.insert(strip_port(&r.domain_pattern).to_string());
            origin_domains.insert(strip_port(&r.backend.host).to_string());
        }
        let (default_backend_host, default_use_tls) = config
            .routes
            .first()
            .map(|r| (r.backend.host.clone(), r.backend.use_tls))
            .unwrap_or_default();
        Self {
            rules,
            origin_domains,
            default_backend_host,
            default_use_tls,
        }
    }
}

fn compile_rule(rule: &RouteRule) -> CompiledRule {
    let inner_rules = rule
        .inner_rules
        .iter()
        .map(|ir| {
            let methods = if ir.methods.is_empty() {
                None
            } else {
                Some(ir.methods.iter().map(|m| m.to_uppercase()).collect())
            };
            let matcher = if let Some(re) = &ir.path_regex {
                PathMatcher::Regex(Regex::new(re).expect("inner rule regex"))
            } else {
                PathMatcher::Prefix(ir.path_prefix.clone().unwrap_or_default())
            };
            CompiledInnerRule {
                methods,
                matcher,
                replacement: ir.replacement.clone(),
                stop: ir.stop,
            }
        })
        .collect();

    CompiledRule {
        id: rule.id.clone(),
        host: HostMatcher::compile(&rule.domain_pattern),
        backend_host: rule.backend.host.clone(),
        use_tls: rule.backend.use_tls,
        path_prefix: rule.path_prefix.clone(),
        inner_rules,
        fallback: rule.fallback,
    }
}

fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Regex-template path rewrite: `$1`, `$2`, ... are replaced with capture
/// groups, same idiom as the teacher's `proxy_rewrite` plugin's
/// `regex_uri` pairs (pattern, template), generalized to a single compiled
/// matcher per inner rule instead of runtime-compiled pairs.
fn apply_regex_template(re: &Regex, template: &str, path: &str) -> Option<String> {
    re.captures(path)
        .map(|caps| {
            let mut out = String::new();
            caps.expand(template, &mut out);
            out
        })
}

type CacheKey = (String, String, String);

pub struct RouteResolver {
    table: ArcSwap<RouteTable>,
    memo: Mutex<LruCache<CacheKey, RouteDecision>>,
}

impl RouteResolver {
    pub fn new(config: &Config) -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::build(config)),
            memo: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(10_000).unwrap())),
        }
    }

    /// Swaps in a freshly built table and clears the memoization cache, same
    /// "rebuild wholesale then atomically swap" idiom as
    /// `proxy::route::reload_global_match`.
    pub fn reload(&self, config: &Config) {
        self.table.store(std::sync::Arc::new(RouteTable::build(config)));
        self.memo.lock().unwrap().clear();
    }

    pub fn is_allowed_host(&self, host: &str) -> bool {
        let table = self.table.load();
        let stripped = strip_port(host);
        table.rules.iter().any(|r| r.host.matches(stripped)) || table.origin_domains.contains(stripped)
    }

    /// Hosts this proxy fronts, for the URL rewriter's skip-rules.
    pub fn fronted_hosts(&self) -> HashSet<String> {
        self.table.load().origin_domains.clone()
    }

    pub fn resolve(&self, host: &str, path: &str, method: &str) -> RouteDecision {
        let key = (host.to_string(), path.to_string(), method.to_string());
        if let Some(hit) = self.memo.lock().unwrap().get(&key) {
            return hit.clone();
        }

        let decision = self.resolve_uncached(host, path, method);
        self.memo.lock().unwrap().put(key, decision.clone());
        decision
    }

    fn resolve_uncached(&self, host: &str, path: &str, method: &str) -> RouteDecision {
        let table = self.table.load();
        let stripped_host = strip_port(host);

        for rule in &table.rules {
            if !rule.host.matches(stripped_host) {
                continue;
            }
            return apply_rule(rule, path, method);
        }

        if table.origin_domains.contains(stripped_host) {
            return RouteDecision::unmatched(
                table.default_backend_host.clone(),
                table.default_use_tls,
                path.to_string(),
            );
        }

        RouteDecision::unmatched(
            table.default_backend_host.clone(),
            table.default_use_tls,
            path.to_string(),
        )
    }
}

fn apply_rule(rule: &CompiledRule, path: &str, method: &str) -> RouteDecision {
    for inner in &rule.inner_rules {
        if let Some(methods) = &inner.methods {
            if !methods.contains(&method.to_uppercase()) {
                continue;
            }
        }
        let rewritten = match &inner.matcher {
            PathMatcher::Regex(re) => apply_regex_template(re, &inner.replacement, path),
            PathMatcher::Prefix(prefix) => {
                if path.starts_with(prefix.as_str()) {
                    Some(format!("{}{}", inner.replacement, &path[prefix.len()..]))
                } else {
                    None
                }
            }
        };
        if let Some(new_path) = rewritten {
            let upstream_path = ensure_leading_slash(&new_path);
            if inner.stop {
                return RouteDecision {
                    backend_host: rule.backend_host.clone(),
                    use_tls: rule.use_tls,
                    upstream_path,
                    matched: true,
                    fallback_used: false,
                    applied_rule: Some(rule.id.clone()),
                };
            }
            return finish_with_prefix(rule, &upstream_path, true);
        }
    }

    finish_with_prefix(rule, path, false)
}

fn finish_with_prefix(rule: &CompiledRule, path: &str, inner_applied: bool) -> RouteDecision {
    if let Some(prefix) = &rule.path_prefix {
        if !path.starts_with(prefix.as_str()) {
            let upstream_path = ensure_leading_slash(&format!("{prefix}{path}"));
            return RouteDecision {
                backend_host: rule.backend_host.clone(),
                use_tls: rule.use_tls,
                upstream_path,
                matched: true,
                fallback_used: false,
                applied_rule: Some(rule.id.clone()),
            };
        }
        return RouteDecision {
            backend_host: rule.backend_host.clone(),
            use_tls: rule.use_tls,
            upstream_path: ensure_leading_slash(path),
            matched: true,
            fallback_used: false,
            applied_rule: Some(rule.id.clone()),
        };
    }

    if inner_applied {
        return RouteDecision {
            backend_host: rule.backend_host.clone(),
            use_tls: rule.use_tls,
            upstream_path: ensure_leading_slash(path),
            matched: true,
            fallback_used: false,
            applied_rule: Some(rule.id.clone()),
        };
    }

    match rule.fallback {
        Fallback::Passthrough => RouteDecision {
            backend_host: rule.backend_host.clone(),
            use_tls: rule.use_tls,
            upstream_path: ensure_leading_slash(path),
            matched: true,
            fallback_used: true,
            applied_rule: Some(rule.id.clone()),
        },
        Fallback::Prefix => RouteDecision {
            backend_host: rule.backend_host.clone(),
            use_tls: rule.use_tls,
            upstream_path: ensure_leading_slash(path),
            matched: true,
            fallback_used: true,
            applied_rule: Some(rule.id.clone()),
        },
        Fallback::Error => RouteDecision {
            backend_host: rule.backend_host.clone(),
            use_tls: rule.use_tls,
            upstream_path: ensure_leading_slash(path),
            matched: false,
            fallback_used: true,
            applied_rule: Some(rule.id.clone()),
        },
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, InnerRule};

    fn rule(id: &str, domain: &str, backend: &str, prefix: Option<&str>) -> RouteRule {
        RouteRule {
            id: id.to_string(),
            domain_pattern: domain.to_string(),
            backend: Backend {
                host: backend.to_string(),
                use_tls: true,
            },
            path_prefix: prefix.map(|s| s.to_string()),
            inner_rules: vec![],
            fallback: Fallback::Prefix,
        }
    }

    fn config_with(routes: Vec<RouteRule>) -> Config {
        let mut conf = Config::default();
        conf.routes = routes;
        conf
    }

    #[test]
    fn domain_to_path_rewrite() {
        let conf = config_with(vec![rule("1", "ddt.example", "origin.example", Some("/ddt"))]);
        let resolver = RouteResolver::new(&conf);
        let decision = resolver.resolve("ddt.example", "/notes/a.html", "GET");
        assert_eq!(decision.backend_host, "origin.example");
        assert_eq!(decision.upstream_path, "/ddt/notes/a.html");
        assert!(decision.matched);
    }

    #[test]
    fn wildcard_domain_matches_single_label() {
        let conf = config_with(vec![rule("1", "*.example.com", "origin.example", None)]);
        let resolver = RouteResolver::new(&conf);
        assert!(resolver.resolve("foo.example.com", "/x", "GET").matched);
        assert!(!resolver.resolve("a.b.example.com", "/x", "GET").matched);
    }

    #[test]
    fn memoized_decision_is_stable() {
        let conf = config_with(vec![rule("1", "a.example", "b.example", None)]);
        let resolver = RouteResolver::new(&conf);
        let first = resolver.resolve("a.example", "/x", "GET");
        let second = resolver.resolve("a.example", "/x", "GET");
        assert_eq!(first, second);
    }

    #[test]
    fn inner_rule_with_stop_skips_prefix() {
        let mut r = rule("1", "a.example", "b.example", Some("/prefix"));
        r.inner_rules.push(InnerRule {
            methods: vec![],
            path_regex: Some("^/special/(.*)$".to_string()),
            path_prefix: None,
            replacement: "/override/$1".to_string(),
            stop: true,
        });
        let conf = config_with(vec![r]);
        let resolver = RouteResolver::new(&conf);
        let decision = resolver.resolve("a.example", "/special/x", "GET");
        assert_eq!(decision.upstream_path, "/override/x");
    }

    #[test]
    fn reload_clears_memo_and_picks_up_new_rules() {
        let conf = config_with(vec![rule("1", "a.example", "b.example", None)]);
        let resolver = RouteResolver::new(&conf);
        resolver.resolve("a.example", "/x", "GET");
        let conf2 = config_with(vec![rule("1", "a.example", "c.example", None)]);
        resolver.reload(&conf2);
        let decision = resolver.resolve("a.example", "/x", "GET");
        assert_eq!(decision.backend_host, "c.example");
    }
}
