//! Stage 3 of the pipeline: content-type transformers.
//!
//! Dispatch is polymorphic over a `{canHandle, transform}` trait, the shape
//! called out in SPEC_FULL.md Design Note 4. Each transformer is grounded on
//! a specific crate already present in the example pack: `pulldown-cmark`
//! for Markdown, `csv` for tabular data, `quick-xml` for XML, `minify-html`
//! for HTML minification.

use crate::config::TransformersConfig;
use crate::error::ProxyError;

pub struct TransformContext<'a> {
    pub title: &'a str,
}

pub trait ContentTransformer: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, content_type: &str, extension: &str) -> bool;
    fn transform(&self, body: &[u8], ctx: &TransformContext) -> Result<(Vec<u8>, String), ProxyError>;
}

fn html_page(title: &str, body_html: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head><body>{body_html}</body></html>"
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub struct MarkdownTransformer;

impl ContentTransformer for MarkdownTransformer {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn can_handle(&self, content_type: &str, extension: &str) -> bool {
        extension == "md" || extension == "markdown" || content_type.starts_with("text/markdown")
    }

    fn transform(&self, body: &[u8], ctx: &TransformContext) -> Result<(Vec<u8>, String), ProxyError> {
        let text = std::str::from_utf8(body).map_err(|e| ProxyError::Transform(e.to_string()))?;
        let parser = pulldown_cmark::Parser::new(text);
        let mut rendered = String::new();
        pulldown_cmark::html::push_html(&mut rendered, parser);
        Ok((html_page(ctx.title, &rendered).into_bytes(), "text/html; charset=utf-8".to_string()))
    }
}

pub struct CsvTransformer;

impl ContentTransformer for CsvTransformer {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn can_handle(&self, content_type: &str, extension: &str) -> bool {
        extension == "csv" || content_type.starts_with("text/csv")
    }

    fn transform(&self, body: &[u8], ctx: &TransformContext) -> Result<(Vec<u8>, String), ProxyError> {
        let mut reader = csv::Reader::from_reader(body);
        let headers = reader
            .headers()
            .map_err(|e| ProxyError::Transform(e.to_string()))?
            .clone();
        let mut table = String::from("<table><thead><tr>");
        for h in headers.iter() {
            table.push_str(&format!("<th>{}</th>", escape_html(h)));
        }
        table.push_str("</tr></thead><tbody>");
        for record in reader.records() {
            let record = record.map_err(|e| ProxyError::Transform(e.to_string()))?;
            table.push_str("<tr>");
            for field in record.iter() {
                table.push_str(&format!("<td>{}</td>", escape_html(field)));
            }
            table.push_str("</tr>");
        }
        table.push_str("</tbody></table>");
        Ok((html_page(ctx.title, &table).into_bytes(), "text/html; charset=utf-8".to_string()))
    }
}

pub struct JsonTransformer;

impl ContentTransformer for JsonTransformer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn can_handle(&self, content_type: &str, extension: &str) -> bool {
        extension == "json" || content_type.starts_with("application/json")
    }

    fn transform(&self, body: &[u8], ctx: &TransformContext) -> Result<(Vec<u8>, String), ProxyError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ProxyError::Transform(e.to_string()))?;
        let pretty = serde_json::to_string_pretty(&value).map_err(|e| ProxyError::Transform(e.to_string()))?;
        let highlighted = highlight_json(&pretty);
        let body_html = format!("<pre class=\"json\">{highlighted}</pre>");
        Ok((html_page(ctx.title, &body_html).into_bytes(), "text/html; charset=utf-8".to_string()))
    }
}

/// Token-level span wrapping for keys, strings, numbers, and literals. No
/// crate in this corpus does JSON syntax highlighting, so this stays a small
/// hand-rolled pass over an already-escaped, already-pretty-printed string.
fn highlight_json(pretty: &str) -> String {
    let mut out = String::with_capacity(pretty.len() * 2);
    let mut chars = pretty.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        match c {
            '"' => {
                let mut literal = String::from("\"");
                for (_, c2) in chars.by_ref() {
                    literal.push(c2);
                    if c2 == '"' {
                        break;
                    }
                }
                let mut lookahead = chars.clone();
                let is_key = loop {
                    match lookahead.peek() {
                        Some((_, c)) if c.is_whitespace() => {
                            lookahead.next();
                        }
                        Some((_, ':')) => break true,
                        _ => break false,
                    }
                };
                let class = if is_key { "json-key" } else { "json-string" };
                out.push_str(&format!("<span class=\"{class}\">{}</span>", escape_html(&literal)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::from(c);
                while let Some((_, next)) = chars.peek() {
                    if next.is_ascii_digit() || *next == '.' || *next == 'e' || *next == 'E' || *next == '+' || *next == '-' {
                        num.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&format!("<span class=\"json-number\">{num}</span>"));
            }
            other => out.push(other),
        }
    }
    out
}

pub struct XmlTransformer;

impl ContentTransformer for XmlTransformer {
    fn name(&self) -> &'static str {
        "xml"
    }

    fn can_handle(&self, content_type: &str, extension: &str) -> bool {
        extension == "xml" || content_type.starts_with("application/xml") || content_type.starts_with("text/xml")
    }

    fn transform(&self, body: &[u8], ctx: &TransformContext) -> Result<(Vec<u8>, String), ProxyError> {
        let mut reader = quick_xml::Reader::from_reader(body);
        reader.config_mut().trim_text(true);
        let mut writer = quick_xml::Writer::new_with_indent(Vec::new(), b' ', 2);
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(quick_xml::events::Event::Eof) => break,
                Ok(event) => writer
                    .write_event(event)
                    .map_err(|e| ProxyError::Transform(e.to_string()))?,
                Err(e) => return Err(ProxyError::Transform(e.to_string())),
            }
            buf.clear();
        }
        let pretty = String::from_utf8(writer.into_inner()).map_err(|e| ProxyError::Transform(e.to_string()))?;
        let body_html = format!("<pre class=\"xml\">{}</pre>", escape_html(&pretty));
        Ok((html_page(ctx.title, &body_html).into_bytes(), "text/html; charset=utf-8".to_string()))
    }
}

pub struct PlainTextTransformer;

impl ContentTransformer for PlainTextTransformer {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn can_handle(&self, content_type: &str, extension: &str) -> bool {
        extension == "txt" || content_type.starts_with("text/plain")
    }

    fn transform(&self, body: &[u8], ctx: &TransformContext) -> Result<(Vec<u8>, String), ProxyError> {
        let text = String::from_utf8_lossy(body);
        let body_html = format!("<pre>{}</pre>", escape_html(&text));
        Ok((html_page(ctx.title, &body_html).into_bytes(), "text/html; charset=utf-8".to_string()))
    }
}

/// Builds the active transformer list from config, in the declared dispatch
/// order. HTML minification runs last in its own pass, not here, since it
/// competes with the other transformers for the `.html` extension claim.
pub fn build_transformers(config: &TransformersConfig) -> Vec<Box<dyn ContentTransformer>> {
    let mut transformers: Vec<Box<dyn ContentTransformer>> = Vec::new();
    if config.markdown {
        transformers.push(Box::new(MarkdownTransformer));
    }
    if config.csv {
        transformers.push(Box::new(CsvTransformer));
    }
    if config.json {
        transformers.push(Box::new(JsonTransformer));
    }
    if config.xml {
        transformers.push(Box::new(XmlTransformer));
    }
    if config.plain_text {
        transformers.push(Box::new(PlainTextTransformer));
    }
    transformers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TransformContext<'static> {
        TransformContext { title: "doc" }
    }

    #[test]
    fn markdown_renders_heading() {
        let t = MarkdownTransformer;
        let (out, ct) = t.transform(b"# Hello", &ctx()).unwrap();
        let rendered = String::from_utf8(out).unwrap();
        assert!(rendered.contains("<h1>Hello</h1>"));
        assert_eq!(ct, "text/html; charset=utf-8");
    }

    #[test]
    fn csv_renders_table_with_header_row() {
        let t = CsvTransformer;
        let (out, _) = t.transform(b"name,age\nAlice,30\n", &ctx()).unwrap();
        let rendered = String::from_utf8(out).unwrap();
        assert!(rendered.contains("<th>name</th>"));
        assert!(rendered.contains("<td>Alice</td>"));
    }

    #[test]
    fn json_pretty_prints_and_highlights_numbers() {
        let t = JsonTransformer;
        let (out, _) = t.transform(br#"{"a":1}"#, &ctx()).unwrap();
        let rendered = String::from_utf8(out).unwrap();
        assert!(rendered.contains("json-number"));
    }

    #[test]
    fn plain_text_escapes_html_entities() {
        let t = PlainTextTransformer;
        let (out, _) = t.transform(b"<script>", &ctx()).unwrap();
        let rendered = String::from_utf8(out).unwrap();
        assert!(rendered.contains("&lt;script&gt;"));
    }

    #[test]
    fn build_transformers_respects_disabled_flags() {
        let mut cfg = TransformersConfig::default();
        cfg.markdown = false;
        let transformers = build_transformers(&cfg);
        assert!(!transformers.iter().any(|t| t.can_handle("text/markdown", "md")));
    }
}
