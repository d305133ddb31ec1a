//! Request and response types plus body decompression.

use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use quantum_http3::HeaderMap;

use crate::error::FetchError;

/// Resource classification driving priority and prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResourceType {
    Document,
    Stylesheet,
    Script,
    Image,
    Font,
    Media,
    Fetch,
    Xhr,
    WebSocket,
    #[default]
    Other,
}

impl ResourceType {
    /// Base weight for the scheduler.
    pub fn base_weight(self) -> f64 {
        match self {
            ResourceType::Document => 10.0,
            ResourceType::Stylesheet => 8.0,
            ResourceType::Script => 7.0,
            ResourceType::Font => 6.0,
            ResourceType::Fetch | ResourceType::Xhr => 5.0,
            ResourceType::Image => 4.0,
            ResourceType::Media => 3.0,
            ResourceType::WebSocket => 5.0,
            ResourceType::Other => 1.0,
        }
    }

    /// Whether a completed response of this type feeds the analyzer.
    pub fn is_analyzable(self) -> bool {
        matches!(
            self,
            ResourceType::Document | ResourceType::Stylesheet | ResourceType::Script
        )
    }
}

/// One fetch request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub resource_type: ResourceType,
    pub in_viewport: bool,
    pub initiator: Option<Url>,
    pub cache_eligible: bool,
    /// Speculative work: scheduled below every user-initiated request.
    pub background: bool,
}

impl Request {
    pub fn get(url: &str) -> Result<Request, FetchError> {
        let url = normalize_url(url)?;
        Ok(Request {
            method: "GET".to_string(),
            url,
            headers: HeaderMap::new(),
            body: None,
            resource_type: ResourceType::Other,
            in_viewport: false,
            initiator: None,
            cache_eligible: true,
            background: false,
        })
    }

    pub fn new(method: &str, url: &str) -> Result<Request, FetchError> {
        let mut request = Request::get(url)?;
        request.method = method.to_ascii_uppercase();
        request.cache_eligible = request.is_idempotent();
        Ok(request)
    }

    pub fn with_type(mut self, resource_type: ResourceType) -> Request {
        self.resource_type = resource_type;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Request {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Request {
        self.headers.append(name, value);
        self
    }

    pub fn in_viewport(mut self, visible: bool) -> Request {
        self.in_viewport = visible;
        self
    }

    pub fn is_idempotent(&self) -> bool {
        matches!(self.method.as_str(), "GET" | "HEAD")
    }

    /// Authority this request connects to, as `host:port`.
    pub fn authority(&self) -> Result<(String, u16), FetchError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(self.url.to_string()))?;
        let port = self.url.port_or_known_default().unwrap_or(443);
        Ok((host.to_string(), port))
    }

    /// `:path` pseudo-header value: path plus query.
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }
}

/// Parse and normalize a URL; only https reaches the HTTP/3 stack.
pub fn normalize_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw).map_err(|e| FetchError::InvalidUrl(format!("{raw}: {e}")))?;
    if url.scheme() != "https" {
        return Err(FetchError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none() {
        return Err(FetchError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

/// A completed fetch response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
    pub from_cache: bool,
    pub used_early_data: bool,
    /// Time to first byte of the response head.
    pub ttfb: Duration,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get("content-type")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    /// Resource type inferred from the Content-Type header.
    pub fn inferred_type(&self) -> ResourceType {
        match self.content_type() {
            Some("text/html") | Some("application/xhtml+xml") => ResourceType::Document,
            Some("text/css") => ResourceType::Stylesheet,
            Some("application/javascript") | Some("text/javascript") => ResourceType::Script,
            Some(ct) if ct.starts_with("image/") => ResourceType::Image,
            Some(ct) if ct.starts_with("font/") => ResourceType::Font,
            Some(ct) if ct.starts_with("audio/") || ct.starts_with("video/") => {
                ResourceType::Media
            }
            _ => ResourceType::Other,
        }
    }
}

/// Decode a body per its Content-Encoding header value.
///
/// Unknown encodings pass the body through untouched; a corrupt encoded
/// body degrades the same way rather than failing the fetch.
pub fn decode_body(encoding: Option<&str>, body: Bytes) -> Bytes {
    let Some(encoding) = encoding else { return body };
    match encoding.trim().to_ascii_lowercase().as_str() {
        "gzip" => {
            let mut out = Vec::with_capacity(body.len() * 4);
            match flate2::read::GzDecoder::new(body.as_ref()).read_to_end(&mut out) {
                Ok(_) => Bytes::from(out),
                Err(e) => {
                    warn!(%e, "gzip decode failed, passing body through");
                    body
                }
            }
        }
        "deflate" => {
            let mut out = Vec::with_capacity(body.len() * 4);
            match flate2::read::ZlibDecoder::new(body.as_ref()).read_to_end(&mut out) {
                Ok(_) => Bytes::from(out),
                Err(e) => {
                    warn!(%e, "deflate decode failed, passing body through");
                    body
                }
            }
        }
        "br" => {
            let mut out = Vec::with_capacity(body.len() * 4);
            match brotli::Decompressor::new(body.as_ref(), 4096).read_to_end(&mut out) {
                Ok(_) => Bytes::from(out),
                Err(e) => {
                    warn!(%e, "brotli decode failed, passing body through");
                    body
                }
            }
        }
        "identity" | "" => body,
        other => {
            warn!(encoding = other, "unknown content-encoding, passing through");
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_rejects_non_https() {
        assert!(matches!(
            normalize_url("http://example.test/"),
            Err(FetchError::UnsupportedScheme(_))
        ));
        assert!(normalize_url("https://example.test/a").is_ok());
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn test_authority_and_path() {
        let request = Request::get("https://example.test:8443/a/b?q=1").unwrap();
        assert_eq!(
            request.authority().unwrap(),
            ("example.test".to_string(), 8443)
        );
        assert_eq!(request.path_and_query(), "/a/b?q=1");

        let request = Request::get("https://example.test/").unwrap();
        assert_eq!(request.authority().unwrap().1, 443);
        assert_eq!(request.path_and_query(), "/");
    }

    #[test]
    fn test_idempotency() {
        assert!(Request::new("GET", "https://a.test/").unwrap().is_idempotent());
        assert!(Request::new("head", "https://a.test/").unwrap().is_idempotent());
        let post = Request::new("POST", "https://a.test/").unwrap();
        assert!(!post.is_idempotent());
        assert!(!post.cache_eligible);
    }

    #[test]
    fn test_base_weights_match_table() {
        assert_eq!(ResourceType::Document.base_weight(), 10.0);
        assert_eq!(ResourceType::Stylesheet.base_weight(), 8.0);
        assert_eq!(ResourceType::Script.base_weight(), 7.0);
        assert_eq!(ResourceType::Font.base_weight(), 6.0);
        assert_eq!(ResourceType::Fetch.base_weight(), 5.0);
        assert_eq!(ResourceType::Image.base_weight(), 4.0);
        assert_eq!(ResourceType::Media.base_weight(), 3.0);
        assert_eq!(ResourceType::Other.base_weight(), 1.0);
    }

    #[test]
    fn test_gzip_round_trip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello gzip body").unwrap();
        let compressed = encoder.finish().unwrap();
        let decoded = decode_body(Some("gzip"), Bytes::from(compressed));
        assert_eq!(decoded.as_ref(), b"hello gzip body");
    }

    #[test]
    fn test_unknown_encoding_passthrough() {
        let body = Bytes::from_static(b"raw");
        assert_eq!(decode_body(Some("zstd"), body.clone()), body);
        assert_eq!(decode_body(None, body.clone()), body);
    }

    #[test]
    fn test_corrupt_gzip_degrades_to_passthrough() {
        let body = Bytes::from_static(b"definitely not gzip");
        assert_eq!(decode_body(Some("gzip"), body.clone()), body);
    }

    #[test]
    fn test_inferred_type() {
        let mut headers = HeaderMap::new();
        headers.set("content-type", "text/html; charset=utf-8");
        let response = Response {
            status: 200,
            headers,
            body: Bytes::new(),
            url: normalize_url("https://a.test/").unwrap(),
            from_cache: false,
            used_early_data: false,
            ttfb: Duration::ZERO,
        };
        assert_eq!(response.inferred_type(), ResourceType::Document);
    }
}
