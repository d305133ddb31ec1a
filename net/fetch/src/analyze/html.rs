//! HTML reference extraction.
//!
//! A tag-level regex scanner: finds the interesting elements, pulls their
//! attributes, resolves URLs against the (possibly `<base>`-overridden)
//! document base, and recurses into inline `<style>`/`<script>` blocks.

use std::collections::HashMap;

use regex::Regex;
use tracing::trace;
use url::Url;

use crate::request::ResourceType;

use super::css::CssExtractor;
use super::js::JsExtractor;
use super::{resolve, ExtractedRef, RefAction};

pub struct HtmlExtractor {
    tag: Regex,
    attr: Regex,
    inline_style: Regex,
    inline_script: Regex,
}

impl HtmlExtractor {
    pub fn new() -> HtmlExtractor {
        HtmlExtractor {
            // Opening tags of interest only.
            tag: Regex::new(
                r"(?is)<(link|script|img|source|video|audio|iframe|meta|base)\b([^>]*)>",
            )
            .expect("static regex"),
            attr: Regex::new(r#"(?is)([a-z][a-z0-9-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
                .expect("static regex"),
            inline_style: Regex::new(r"(?is)<style\b[^>]*>(.*?)</style>").expect("static regex"),
            inline_script: Regex::new(r"(?is)<script\b([^>]*)>(.*?)</script>")
                .expect("static regex"),
        }
    }

    fn attrs(&self, raw: &str) -> HashMap<String, String> {
        self.attr
            .captures_iter(raw)
            .filter_map(|c| {
                let name = c.get(1)?.as_str().to_ascii_lowercase();
                let value = c
                    .get(2)
                    .or_else(|| c.get(3))
                    .or_else(|| c.get(4))?
                    .as_str()
                    .to_string();
                Some((name, value))
            })
            .collect()
    }

    pub fn extract(
        &self,
        html: &str,
        document_base: &Url,
        viewport_width: u32,
        css: &CssExtractor,
        js: &JsExtractor,
    ) -> Vec<ExtractedRef> {
        // A <base href> overrides resolution for everything after it; the
        // first one wins, matching how documents are parsed.
        let mut base = document_base.clone();
        for captures in self.tag.captures_iter(html) {
            if captures[1].eq_ignore_ascii_case("base") {
                let attrs = self.attrs(&captures[2]);
                if let Some(href) = attrs.get("href") {
                    if let Ok(resolved) = document_base.join(href) {
                        trace!(base = %resolved, "base href override");
                        base = resolved;
                    }
                }
                break;
            }
        }

        let mut refs = Vec::new();
        for captures in self.tag.captures_iter(html) {
            let tag = captures[1].to_ascii_lowercase();
            let attrs = self.attrs(&captures[2]);
            match tag.as_str() {
                "link" => self.extract_link(&attrs, &base, &mut refs),
                "script" => {
                    if let Some(src) = attrs.get("src") {
                        push(&mut refs, &base, src, ResourceType::Script, 1.0, RefAction::Fetch);
                    }
                }
                "img" => {
                    let picked = attrs
                        .get("srcset")
                        .and_then(|s| select_srcset(s, viewport_width))
                        .or_else(|| attrs.get("src").cloned());
                    if let Some(src) = picked {
                        push(&mut refs, &base, &src, ResourceType::Image, 0.8, RefAction::Fetch);
                    }
                }
                "source" => {
                    let picked = attrs
                        .get("srcset")
                        .and_then(|s| select_srcset(s, viewport_width))
                        .or_else(|| attrs.get("src").cloned());
                    if let Some(src) = picked {
                        let kind = if attrs.contains_key("srcset") {
                            ResourceType::Image
                        } else {
                            ResourceType::Media
                        };
                        push(&mut refs, &base, &src, kind, 0.6, RefAction::Fetch);
                    }
                }
                "video" | "audio" => {
                    if let Some(src) = attrs.get("src") {
                        push(&mut refs, &base, src, ResourceType::Media, 0.5, RefAction::Fetch);
                    }
                }
                "iframe" => {
                    if let Some(src) = attrs.get("src") {
                        push(&mut refs, &base, src, ResourceType::Document, 0.6, RefAction::Fetch);
                    }
                }
                "meta" => {
                    let name = attrs.get("name").map(String::as_str).unwrap_or("");
                    if name.eq_ignore_ascii_case("x-quantum-preload") {
                        if let Some(content) = attrs.get("content") {
                            for candidate in content.split(',') {
                                push(
                                    &mut refs,
                                    &base,
                                    candidate,
                                    ResourceType::Fetch,
                                    1.0,
                                    RefAction::Fetch,
                                );
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Inline <style> blocks go through the CSS extractor.
        for captures in self.inline_style.captures_iter(html) {
            refs.extend(css.extract(&captures[1], &base));
        }
        // Inline <script> blocks (no src attribute) through the JS one.
        for captures in self.inline_script.captures_iter(html) {
            if !self.attrs(&captures[1]).contains_key("src") {
                refs.extend(js.extract(&captures[2], &base));
            }
        }
        refs
    }

    fn extract_link(
        &self,
        attrs: &HashMap<String, String>,
        base: &Url,
        refs: &mut Vec<ExtractedRef>,
    ) {
        let Some(href) = attrs.get("href") else { return };
        let rel = attrs.get("rel").map(String::as_str).unwrap_or("").to_ascii_lowercase();
        for rel in rel.split_whitespace() {
            match rel {
                "stylesheet" => {
                    push(refs, base, href, ResourceType::Stylesheet, 1.0, RefAction::Fetch)
                }
                "preload" | "modulepreload" => {
                    let kind = match attrs.get("as").map(String::as_str) {
                        Some("style") => ResourceType::Stylesheet,
                        Some("script") => ResourceType::Script,
                        Some("font") => ResourceType::Font,
                        Some("image") => ResourceType::Image,
                        Some("document") => ResourceType::Document,
                        _ if rel == "modulepreload" => ResourceType::Script,
                        _ => ResourceType::Other,
                    };
                    push(refs, base, href, kind, 0.9, RefAction::Fetch);
                }
                "icon" | "apple-touch-icon" => {
                    push(refs, base, href, ResourceType::Image, 0.4, RefAction::Fetch)
                }
                "manifest" => push(refs, base, href, ResourceType::Other, 0.4, RefAction::Fetch),
                "preconnect" => {
                    push(refs, base, href, ResourceType::Other, 0.5, RefAction::Preconnect)
                }
                "dns-prefetch" => {
                    push(refs, base, href, ResourceType::Other, 0.3, RefAction::DnsPrefetch)
                }
                _ => {}
            }
        }
    }
}

impl Default for HtmlExtractor {
    fn default() -> Self {
        HtmlExtractor::new()
    }
}

fn push(
    refs: &mut Vec<ExtractedRef>,
    base: &Url,
    raw: &str,
    resource_type: ResourceType,
    weight_hint: f64,
    action: RefAction,
) {
    if let Some(url) = resolve(base, raw) {
        refs.push(ExtractedRef { url, resource_type, weight_hint, action });
    }
}

/// Pick one candidate from a `srcset`: with width descriptors, the
/// smallest at least 1.5× the viewport width, else the largest below.
fn select_srcset(srcset: &str, viewport_width: u32) -> Option<String> {
    let mut widths: Vec<(String, u32)> = Vec::new();
    let mut first: Option<String> = None;
    for candidate in srcset.split(',') {
        let mut parts = candidate.split_whitespace();
        let Some(url) = parts.next() else { continue };
        if first.is_none() {
            first = Some(url.to_string());
        }
        if let Some(width) = parts
            .next()
            .and_then(|d| d.strip_suffix('w'))
            .and_then(|n| n.parse::<u32>().ok())
        {
            widths.push((url.to_string(), width));
        }
    }
    if widths.is_empty() {
        return first;
    }
    widths.sort_by_key(|&(_, w)| w);
    let target = (viewport_width as f64 * 1.5) as u32;
    widths
        .iter()
        .find(|&&(_, width)| width >= target)
        .or_else(|| widths.last())
        .map(|(url, _)| url.clone())
}
