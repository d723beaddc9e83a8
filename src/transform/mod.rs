//! Ordered body-transformation stages run between an upstream/file-resolved
//! fetch and the bytes written to the client: decompress, content-type
//! transform, URL rewrite. See `decompress`, `content`, `urlrewrite`.

pub mod content;
pub mod decompress;
pub mod urlrewrite;

use std::collections::HashSet;

use crate::config::{Config, TransformersConfig, UrlTransformConfig};
use crate::error::ProxyError;
use content::{build_transformers, ContentTransformer, TransformContext};
use decompress::Encoding;
use urlrewrite::UrlRewriter;

pub struct TransformOutcome {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub modified: bool,
    /// Name of the content transformer that ran, if stage 3 matched one.
    pub transformer: Option<String>,
}

pub struct TransformPipeline {
    transformers: Vec<Box<dyn ContentTransformer>>,
    url_rewriter: UrlRewriter,
    url_transform: UrlTransformConfig,
    minify_html: bool,
}

impl TransformPipeline {
    pub fn new(config: &Config, fronted_hosts: HashSet<String>) -> Self {
        Self {
            transformers: build_transformers(&config.transformers),
            url_rewriter: UrlRewriter::new(config.url_transform.clone(), fronted_hosts),
            url_transform: config.url_transform.clone(),
            minify_html: config.transformers.minify_html,
        }
    }

    pub fn reload_fronted_hosts(&mut self, hosts: HashSet<String>) {
        self.url_rewriter.set_fronted_hosts(hosts);
    }

    pub fn url_rewrite_cache_len(&self) -> usize {
        self.url_rewriter.cache_len()
    }

    pub fn clear_url_rewrite_cache(&self) {
        self.url_rewriter.clear_cache();
    }

    /// Runs the full pipeline. `extension` is the file extension that
    /// triggered a file-resolve, if any — content transformers only run for
    /// file-resolved bodies, per §4.5 stage 3.
    pub fn run(
        &self,
        body: Vec<u8>,
        content_type: &str,
        content_encoding: Option<&str>,
        extension: Option<&str>,
        proxy_host: &str,
        protocol: &str,
        title: &str,
    ) -> Result<TransformOutcome, ProxyError> {
        let encoding = content_encoding.map(Encoding::from_header).unwrap_or(Encoding::Identity);
        let (decoded, was_compressed) = match decompress::decompress(body.clone(), encoding, content_type) {
            Ok(pair) => pair,
            Err(ProxyError::DecompressionFatal(msg)) => return Err(ProxyError::DecompressionFatal(msg)),
            Err(ProxyError::DecompressionSoft(_)) => {
                return Ok(TransformOutcome {
                    body,
                    content_type: content_type.to_string(),
                    content_encoding: content_encoding.map(|s| s.to_string()),
                    modified: false,
                    transformer: None,
                });
            }
            Err(other) => return Err(other),
        };

        let mut current_body = decoded;
        let mut current_type = content_type.to_string();
        let mut modified = was_compressed;
        let mut transformer_name = None;

        if current_body.len() as u64 <= self.url_transform.max_content_size {
            if let Some(ext) = extension {
                if let Some(transformer) = self
                    .transformers
                    .iter()
                    .find(|t| t.can_handle(&current_type, ext))
                {
                    match transformer.transform(&current_body, &TransformContext { title }) {
                        Ok((out, new_type)) => {
                            current_body = out;
                            current_type = new_type;
                            modified = true;
                            transformer_name = Some(transformer.name().to_string());
                        }
                        Err(e) => {
                            log::warn!("content transform failed, serving original bytes: {e}");
                        }
                    }
                }
            }

            if self.should_rewrite_urls(&current_type) {
                if let Ok(text) = String::from_utf8(current_body.clone()) {
                    let rewritten = self.url_rewriter.rewrite(&text, &current_type, proxy_host, protocol);
                    if rewritten != text {
                        modified = true;
                    }
                    current_body = rewritten.into_bytes();
                }
            }

            if self.minify_html && current_type.starts_with("text/html") {
                let cfg = minify_html::Cfg::default();
                let minified = minify_html::minify(&current_body, &cfg);
                if minified != current_body {
                    current_body = minified;
                    modified = true;
                }
            }
        }

        let content_encoding = if modified { None } else { content_encoding.map(|s| s.to_string()) };

        Ok(TransformOutcome {
            body: current_body,
            content_type: current_type,
            content_encoding,
            modified,
            transformer: transformer_name,
        })
    }

    fn should_rewrite_urls(&self, content_type: &str) -> bool {
        if !self.url_transform.enabled {
            return false;
        }
        (content_type.starts_with("text/html") && self.url_transform.transform_html)
            || (is_js(content_type) && self.url_transform.transform_js)
            || (content_type.starts_with("text/css") && self.url_transform.transform_css)
    }
}

fn is_js(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or(content_type).trim();
    matches!(
        base,
        "application/javascript" | "text/javascript" | "application/x-javascript" | "application/ecmascript"
    )
}

#[allow(dead_code)]
fn transformers_enabled(cfg: &TransformersConfig) -> bool {
    cfg.markdown || cfg.csv || cfg.json || cfg.xml || cfg.plain_text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    fn pipeline() -> TransformPipeline {
        let config = Config::default();
        let mut hosts = HashSet::new();
        hosts.insert("origin.example".to_string());
        TransformPipeline::new(&config, hosts)
    }

    #[test]
    fn decompresses_and_converts_markdown_to_html() {
        let p = pipeline();
        let compressed = gzip(b"# Title");
        let out = p
            .run(compressed, "text/markdown", Some("gzip"), Some("md"), "cdn.example", "https", "doc")
            .unwrap();
        let rendered = String::from_utf8(out.body).unwrap();
        assert!(rendered.contains("<h1>Title</h1>"));
        assert_eq!(out.content_type, "text/html; charset=utf-8");
        assert!(out.content_encoding.is_none());
    }

    #[test]
    fn corrupt_js_short_circuits_with_fatal_error() {
        let p = pipeline();
        let err = p
            .run(b"garbage".to_vec(), "application/javascript", Some("gzip"), None, "cdn.example", "https", "doc")
            .unwrap_err();
        assert!(matches!(err, ProxyError::DecompressionFatal(_)));
    }

    #[test]
    fn rewrites_urls_in_plain_html_without_extension() {
        let p = pipeline();
        let html = br#"<a href="https://origin.example/x">x</a>"#.to_vec();
        let out = p
            .run(html, "text/html", None, None, "cdn.example", "https", "doc")
            .unwrap();
        let rendered = String::from_utf8(out.body).unwrap();
        assert!(rendered.contains("https://cdn.example/x"));
    }

    #[test]
    fn oversized_body_skips_transformation_stages() {
        let mut config = Config::default();
        config.url_transform.max_content_size = 1;
        let hosts = HashSet::new();
        let p = TransformPipeline::new(&config, hosts);
        let html = br#"<a href="https://origin.example/x">x</a>"#.to_vec();
        let out = p
            .run(html.clone(), "text/html", None, None, "cdn.example", "https", "doc")
            .unwrap();
        assert_eq!(out.body, html);
    }
}
