//! Stage 4 of the pipeline: rewrites absolute/protocol-relative URLs that
//! target a fronted origin so they instead point at the proxy host.
//!
//! Grounded on `src/utils/request.rs`'s host/header parsing helpers for the
//! general style of small regex-driven string surgery this module does; the
//! per-context pattern tables themselves have no teacher counterpart and are
//! built fresh from SPEC_FULL.md §4.5.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::UrlTransformConfig;

const SKIPPED_SCHEMES: &[&str] = &["data", "javascript", "mailto", "tel", "sms", "blob"];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RewriteCacheKey {
    url: String,
    proxy_host: String,
    protocol: String,
    upstream_target: String,
}

pub struct UrlRewriter {
    config: UrlTransformConfig,
    fronted_hosts: HashSet<String>,
    memo: Mutex<lru::LruCache<RewriteCacheKey, String>>,
}

static HTML_URL_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?P<attr>href|src|action|poster|manifest|data-[\w-]*url)(?P<eq>\s*=\s*)(?P<quote>["'])(?P<url>[^"']+)["']"#).unwrap()
});
static HTML_STYLE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"url\(\s*(['"]?)([^'")]+)\1\s*\)"#).unwrap());
static JS_URL_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?P<call>fetch|open|import)\(\s*(?P<quote>['"`])(?P<url>https?://[^'"`]+|//[^'"`]+)["'`]"#).unwrap()
});
static JS_LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?P<prop>location(?:\.href)?\s*=\s*)(?P<quote>['"`])(?P<url>https?://[^'"`]+|//[^'"`]+)["'`]"#).unwrap()
});
static CSS_URL_FN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"url\(\s*(['"]?)([^'")]+)\1\s*\)"#).unwrap());
static CSS_IMPORT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"@import\s+(['"])([^'"]+)\1"#).unwrap());

impl UrlRewriter {
    pub fn new(config: UrlTransformConfig, fronted_hosts: HashSet<String>) -> Self {
        let cap = config.max_cache_size.max(1);
        Self {
            config,
            fronted_hosts,
            memo: Mutex::new(lru::LruCache::new(NonZeroUsize::new(cap).unwrap())),
        }
    }

    pub fn set_fronted_hosts(&mut self, hosts: HashSet<String>) {
        self.fronted_hosts = hosts;
    }

    pub fn cache_len(&self) -> usize {
        self.memo.lock().unwrap().len()
    }

    pub fn clear_cache(&self) {
        self.memo.lock().unwrap().clear();
    }

    pub fn rewrite(&self, body: &str, content_type: &str, proxy_host: &str, protocol: &str) -> String {
        if !self.config.enabled {
            return body.to_string();
        }
        if content_type.starts_with("text/html") && self.config.transform_html {
            self.rewrite_html(body, proxy_host, protocol)
        } else if is_js(content_type) && self.config.transform_js {
            self.rewrite_with(body, proxy_host, protocol, &[&*JS_URL_CALL, &*JS_LOCATION])
        } else if content_type.starts_with("text/css") && self.config.transform_css {
            self.rewrite_css(body, proxy_host, protocol)
        } else {
            body.to_string()
        }
    }

    fn rewrite_html(&self, body: &str, proxy_host: &str, protocol: &str) -> String {
        let after_attrs = HTML_URL_ATTR.replace_all(body, |caps: &regex::Captures| {
            let rewritten = self.maybe_rewrite(&caps["url"], proxy_host, protocol);
            format!("{}{}\"{}\"", &caps["attr"], &caps["eq"], rewritten)
        });
        if self.config.transform_inline {
            HTML_STYLE_URL
                .replace_all(&after_attrs, |caps: &regex::Captures| {
                    let rewritten = self.maybe_rewrite(&caps[2], proxy_host, protocol);
                    format!("url({}{}{})", &caps[1], rewritten, &caps[1])
                })
                .into_owned()
        } else {
            after_attrs.into_owned()
        }
    }

    fn rewrite_css(&self, body: &str, proxy_host: &str, protocol: &str) -> String {
        let after_url = CSS_URL_FN.replace_all(body, |caps: &regex::Captures| {
            let rewritten = self.maybe_rewrite(&caps[2], proxy_host, protocol);
            format!("url({}{}{})", &caps[1], rewritten, &caps[1])
        });
        CSS_IMPORT
            .replace_all(&after_url, |caps: &regex::Captures| {
                let rewritten = self.maybe_rewrite(&caps[2], proxy_host, protocol);
                format!("@import {}{}{}", &caps[1], rewritten, &caps[1])
            })
            .into_owned()
    }

    fn rewrite_with(&self, body: &str, proxy_host: &str, protocol: &str, patterns: &[&Regex]) -> String {
        let mut out = body.to_string();
        for pattern in patterns {
            out = pattern
                .replace_all(&out, |caps: &regex::Captures| {
                    let rewritten = self.maybe_rewrite(&caps["url"], proxy_host, protocol);
                    let prefix = caps
                        .name("call")
                        .map(|m| format!("{}(", m.as_str()))
                        .or_else(|| caps.name("prop").map(|m| m.as_str().to_string()))
                        .unwrap_or_default();
                    let quote = &caps["quote"];
                    format!("{prefix}{quote}{rewritten}{quote}")
                })
                .into_owned();
        }
        out
    }

    fn maybe_rewrite(&self, url: &str, proxy_host: &str, protocol: &str) -> String {
        if let Some(scheme) = url.split(':').next() {
            if SKIPPED_SCHEMES.contains(&scheme) && url.contains(':') {
                return url.to_string();
            }
        }
        let (host, rest) = match split_host(url) {
            Some(parts) => parts,
            None => return url.to_string(),
        };
        if host == proxy_host {
            return url.to_string();
        }
        if !self.fronted_hosts.contains(host) {
            return url.to_string();
        }

        let key = RewriteCacheKey {
            url: url.to_string(),
            proxy_host: proxy_host.to_string(),
            protocol: protocol.to_string(),
            upstream_target: host.to_string(),
        };
        if let Some(hit) = self.memo.lock().unwrap().get(&key) {
            return hit.clone();
        }

        let (path, query, fragment) = split_path_query_fragment(rest);
        let mut rewritten = format!("{protocol}://{proxy_host}{path}");
        if self.config.preserve_query && !query.is_empty() {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        if self.config.preserve_fragments && !fragment.is_empty() {
            rewritten.push('#');
            rewritten.push_str(fragment);
        }
        self.memo.lock().unwrap().put(key, rewritten.clone());
        rewritten
    }
}

fn is_js(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or(content_type).trim();
    matches!(
        base,
        "application/javascript" | "text/javascript" | "application/x-javascript" | "application/ecmascript"
    )
}

/// Splits `https://host/rest` or `//host/rest` into `(host, "/rest...")`.
/// Returns `None` for relative URLs, which never need rewriting.
fn split_host(url: &str) -> Option<(&str, &str)> {
    let after_scheme = if let Some(rest) = url.strip_prefix("//") {
        rest
    } else if let Some(idx) = url.find("://") {
        &url[idx + 3..]
    } else {
        return None;
    };
    let end = after_scheme.find('/').unwrap_or(after_scheme.len());
    let host = &after_scheme[..end];
    let host = host.split(':').next().unwrap_or(host);
    Some((host, &after_scheme[end..]))
}

fn split_path_query_fragment(rest: &str) -> (&str, &str, &str) {
    let (path_and_query, fragment) = rest.split_once('#').unwrap_or((rest, ""));
    let (path, query) = path_and_query.split_once('?').unwrap_or((path_and_query, ""));
    let path = if path.is_empty() { "/" } else { path };
    (path, query, fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> UrlRewriter {
        let mut hosts = HashSet::new();
        hosts.insert("origin.example".to_string());
        UrlRewriter::new(UrlTransformConfig::default(), hosts)
    }

    #[test]
    fn rewrites_html_href_to_proxy_host() {
        let r = rewriter();
        let out = r.rewrite(
            r#"<a href="https://origin.example/a/b?x=1#frag">link</a>"#,
            "text/html",
            "cdn.example",
            "https",
        );
        assert!(out.contains(r#"href="https://cdn.example/a/b?x=1#frag""#));
    }

    #[test]
    fn leaves_unrelated_hosts_untouched() {
        let r = rewriter();
        let out = r.rewrite(
            r#"<img src="https://unrelated.example/x.png">"#,
            "text/html",
            "cdn.example",
            "https",
        );
        assert!(out.contains("https://unrelated.example/x.png"));
    }

    #[test]
    fn skips_data_and_mailto_schemes() {
        let r = rewriter();
        let out = r.rewrite(
            r#"<a href="mailto:a@origin.example">mail</a><img src="data:image/png;base64,abc">"#,
            "text/html",
            "cdn.example",
            "https",
        );
        assert!(out.contains("mailto:a@origin.example"));
        assert!(out.contains("data:image/png;base64,abc"));
    }

    #[test]
    fn rewrites_css_url_function() {
        let r = rewriter();
        let out = r.rewrite(
            "body { background: url(//origin.example/bg.png); }",
            "text/css",
            "cdn.example",
            "https",
        );
        assert!(out.contains("url(https://cdn.example/bg.png)"));
    }

    #[test]
    fn already_proxied_urls_are_left_alone() {
        let r = rewriter();
        let out = r.rewrite(
            r#"<a href="https://cdn.example/already">x</a>"#,
            "text/html",
            "cdn.example",
            "https",
        );
        assert!(out.contains("https://cdn.example/already"));
    }
}
