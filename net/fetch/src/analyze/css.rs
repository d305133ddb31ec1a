//! CSS reference extraction: `@import` plus `url(...)` values.

use regex::Regex;
use url::Url;

use crate::request::ResourceType;

use super::{resolve, ExtractedRef, RefAction};

pub struct CssExtractor {
    import: Regex,
    url_fn: Regex,
}

impl CssExtractor {
    pub fn new() -> CssExtractor {
        CssExtractor {
            import: Regex::new(
                r#"(?i)@import\s+(?:url\(\s*)?["']?([^"'()\s;]+)["']?\s*\)?"#,
            )
            .expect("static regex"),
            url_fn: Regex::new(r#"(?i)url\(\s*["']?([^"')]+)["']?\s*\)"#).expect("static regex"),
        }
    }

    pub fn extract(&self, css: &str, base: &Url) -> Vec<ExtractedRef> {
        let mut refs = Vec::new();
        for captures in self.import.captures_iter(css) {
            if let Some(url) = resolve(base, &captures[1]) {
                refs.push(ExtractedRef {
                    url,
                    resource_type: ResourceType::Stylesheet,
                    weight_hint: 0.9,
                    action: RefAction::Fetch,
                });
            }
        }
        for captures in self.url_fn.captures_iter(css) {
            let raw = captures[1].trim();
            // @import url(...) already handled above.
            if self
                .import
                .captures_iter(css)
                .any(|c| c.get(1).map(|m| m.as_str()) == Some(raw))
            {
                continue;
            }
            if let Some(url) = resolve(base, raw) {
                let resource_type = classify_by_extension(url.path());
                refs.push(ExtractedRef {
                    url,
                    resource_type,
                    weight_hint: if resource_type == ResourceType::Font { 0.8 } else { 0.5 },
                    action: RefAction::Fetch,
                });
            }
        }
        refs
    }
}

impl Default for CssExtractor {
    fn default() -> Self {
        CssExtractor::new()
    }
}

fn classify_by_extension(path: &str) -> ResourceType {
    let extension = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match extension.as_str() {
        "woff" | "woff2" | "ttf" | "otf" | "eot" => ResourceType::Font,
        "css" => ResourceType::Stylesheet,
        _ => ResourceType::Image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(css: &str) -> Vec<ExtractedRef> {
        let base = Url::parse("https://example.test/styles/main.css").unwrap();
        CssExtractor::new().extract(css, &base)
    }

    #[test]
    fn test_import_forms() {
        let refs = extract(
            r#"@import url("/reset.css");
               @import 'theme.css';
               @import url(print.css);"#,
        );
        assert_eq!(refs.len(), 3);
        assert!(refs.iter().all(|r| r.resource_type == ResourceType::Stylesheet));
        assert_eq!(refs[0].url.as_str(), "https://example.test/reset.css");
        assert_eq!(refs[1].url.as_str(), "https://example.test/styles/theme.css");
    }

    #[test]
    fn test_font_and_image_urls() {
        let refs = extract(
            r#"@font-face { src: url("/fonts/sans.woff2") format("woff2"); }
               .hero { background-image: url(../img/hero.jpg); }"#,
        );
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].resource_type, ResourceType::Font);
        assert_eq!(refs[1].resource_type, ResourceType::Image);
        assert_eq!(refs[1].url.as_str(), "https://example.test/img/hero.jpg");
    }

    #[test]
    fn test_data_urls_skipped() {
        let refs = extract(r#".icon { background: url(data:image/png;base64,AAAA); }"#);
        assert!(refs.is_empty());
    }
}
