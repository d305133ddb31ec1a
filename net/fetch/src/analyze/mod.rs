//! Dependency extraction from fetched documents.
//!
//! Best-effort reference extraction from HTML, CSS and JavaScript bodies.
//! Extractors are regex-driven scanners, not full parsers; anything they
//! miss simply is not predicted, and a malformed document yields an empty
//! list instead of an error.

mod css;
mod html;
mod js;

pub use css::CssExtractor;
pub use html::HtmlExtractor;
pub use js::JsExtractor;

use url::Url;

use crate::request::ResourceType;

/// What to do with an extracted reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefAction {
    /// Candidate for a prefetch.
    Fetch,
    /// `<link rel="preconnect">`: open a connection, fetch nothing.
    Preconnect,
    /// `<link rel="dns-prefetch">`: resolve the host, fetch nothing.
    DnsPrefetch,
}

/// One outbound reference found in a document.
#[derive(Debug, Clone)]
pub struct ExtractedRef {
    pub url: Url,
    pub resource_type: ResourceType,
    /// Position-derived hint in (0, 1]; earlier references score higher.
    pub weight_hint: f64,
    pub action: RefAction,
}

/// Combined analyzer over the three extractors.
pub struct DependencyAnalyzer {
    html: HtmlExtractor,
    css: CssExtractor,
    js: JsExtractor,
    viewport_width: u32,
}

impl DependencyAnalyzer {
    pub fn new(viewport_width: u32) -> DependencyAnalyzer {
        DependencyAnalyzer {
            html: HtmlExtractor::new(),
            css: CssExtractor::new(),
            js: JsExtractor::new(),
            viewport_width,
        }
    }

    /// Extract references from a completed response body.
    pub fn analyze(
        &self,
        resource_type: ResourceType,
        body: &[u8],
        base_url: &Url,
    ) -> Vec<ExtractedRef> {
        let Ok(text) = std::str::from_utf8(body) else {
            return Vec::new();
        };
        let mut refs = match resource_type {
            ResourceType::Document => {
                self.html
                    .extract(text, base_url, self.viewport_width, &self.css, &self.js)
            }
            ResourceType::Stylesheet => self.css.extract(text, base_url),
            ResourceType::Script => self.js.extract(text, base_url),
            _ => Vec::new(),
        };
        // Position decay: earlier references are likelier to be needed
        // first.
        for (index, r) in refs.iter_mut().enumerate() {
            r.weight_hint *= 1.0 - (index as f64 * 0.02).min(0.5);
        }
        refs
    }
}

/// Resolve a candidate reference against the document base.
///
/// Skips pseudo-schemes and anything that cannot travel over this stack.
pub(crate) fn resolve(base: &Url, raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty()
        || raw.starts_with('#')
        || raw.starts_with("data:")
        || raw.starts_with("javascript:")
        || raw.starts_with("about:")
        || raw.starts_with("blob:")
    {
        return None;
    }
    let url = base.join(raw).ok()?;
    match url.scheme() {
        "https" => Some(url),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.test/page/index.html").unwrap()
    }

    #[test]
    fn test_resolve_relative_forms() {
        let base = base();
        assert_eq!(
            resolve(&base, "/s.css").unwrap().as_str(),
            "https://example.test/s.css"
        );
        assert_eq!(
            resolve(&base, "a.js").unwrap().as_str(),
            "https://example.test/page/a.js"
        );
        assert_eq!(
            resolve(&base, "//cdn.test/lib.js").unwrap().as_str(),
            "https://cdn.test/lib.js"
        );
    }

    #[test]
    fn test_resolve_skips_pseudo_schemes() {
        let base = base();
        assert!(resolve(&base, "#fragment").is_none());
        assert!(resolve(&base, "data:image/png;base64,xyz").is_none());
        assert!(resolve(&base, "javascript:void(0)").is_none());
        assert!(resolve(&base, "http://insecure.test/x").is_none());
        assert!(resolve(&base, "").is_none());
    }

    #[test]
    fn test_analyze_dispatches_by_type() {
        let analyzer = DependencyAnalyzer::new(1280);
        let html = br#"<link rel="stylesheet" href="/s.css">"#;
        let refs = analyzer.analyze(ResourceType::Document, html, &base());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].resource_type, ResourceType::Stylesheet);

        let css = b"@import url(/deep.css);";
        let refs = analyzer.analyze(ResourceType::Stylesheet, css, &base());
        assert_eq!(refs.len(), 1);

        // Binary bodies are tolerated.
        let refs = analyzer.analyze(ResourceType::Document, &[0xff, 0xfe, 0x00], &base());
        assert!(refs.is_empty());

        let refs = analyzer.analyze(ResourceType::Image, b"png...", &base());
        assert!(refs.is_empty());
    }

    #[test]
    fn test_position_decay_orders_hints() {
        let analyzer = DependencyAnalyzer::new(1280);
        let html = br#"
            <link rel="stylesheet" href="/a.css">
            <link rel="stylesheet" href="/b.css">
            <link rel="stylesheet" href="/c.css">
        "#;
        let refs = analyzer.analyze(ResourceType::Document, html, &base());
        assert_eq!(refs.len(), 3);
        assert!(refs[0].weight_hint > refs[1].weight_hint);
        assert!(refs[1].weight_hint > refs[2].weight_hint);
    }
}
