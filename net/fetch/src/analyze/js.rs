//! JavaScript reference extraction (best effort).
//!
//! Regex scanning over source text: static and dynamic imports, fetch and
//! XHR targets, WebSocket endpoints, programmatic image loads and service
//! worker registration. Bare module specifiers are skipped since they
//! resolve through import maps, not URLs.

use regex::Regex;
use url::Url;

use crate::request::ResourceType;

use super::{resolve, ExtractedRef, RefAction};

pub struct JsExtractor {
    patterns: Vec<(Regex, ResourceType, f64)>,
}

impl JsExtractor {
    pub fn new() -> JsExtractor {
        let table: &[(&str, ResourceType, f64)] = &[
            // import("...") / import "..." / import x from "..."
            (r#"(?i)\bimport\s*\(\s*["']([^"']+)["']"#, ResourceType::Script, 0.8),
            (r#"\bimport\s+["']([^"']+)["']"#, ResourceType::Script, 0.8),
            (r#"\bfrom\s+["']([^"']+)["']"#, ResourceType::Script, 0.8),
            (r#"\bfetch\s*\(\s*["']([^"']+)["']"#, ResourceType::Fetch, 0.7),
            (
                r#"\.open\s*\(\s*["'][A-Za-z]+["']\s*,\s*["']([^"']+)["']"#,
                ResourceType::Xhr,
                0.6,
            ),
            (
                r#"\bnew\s+WebSocket\s*\(\s*["']([^"']+)["']"#,
                ResourceType::WebSocket,
                0.3,
            ),
            (r#"\.src\s*=\s*["']([^"']+)["']"#, ResourceType::Image, 0.5),
            (
                r#"serviceWorker\s*\.\s*register\s*\(\s*["']([^"']+)["']"#,
                ResourceType::Script,
                0.4,
            ),
        ];
        JsExtractor {
            patterns: table
                .iter()
                .map(|(pattern, kind, hint)| {
                    (Regex::new(pattern).expect("static regex"), *kind, *hint)
                })
                .collect(),
        }
    }

    pub fn extract(&self, source: &str, base: &Url) -> Vec<ExtractedRef> {
        let mut refs: Vec<ExtractedRef> = Vec::new();
        for (pattern, resource_type, weight_hint) in &self.patterns {
            for captures in pattern.captures_iter(source) {
                let raw = &captures[1];
                // Bare specifiers ("react", "lodash/map") are not URLs.
                if *resource_type == ResourceType::Script
                    && !raw.starts_with('/')
                    && !raw.starts_with('.')
                    && !raw.contains("://")
                {
                    continue;
                }
                let Some(url) = resolve(base, raw) else { continue };
                if refs.iter().any(|r| r.url == url) {
                    continue;
                }
                refs.push(ExtractedRef {
                    url,
                    resource_type: *resource_type,
                    weight_hint: *weight_hint,
                    action: RefAction::Fetch,
                });
            }
        }
        refs
    }
}

impl Default for JsExtractor {
    fn default() -> Self {
        JsExtractor::new()
    }
}
