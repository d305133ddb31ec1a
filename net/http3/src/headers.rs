//! Case-insensitive, order-preserving header multimap.
//!
//! Same-name fields keep their relative insertion order and are never
//! collapsed; HTTP/3 permits splitting Cookie, so the map treats it like
//! any other repeatable field. Pseudo-header construction and validation
//! for the request path live here too.

use crate::error::H3Error;

/// An ordered multimap of header fields with case-insensitive names.
///
/// Names are normalized to lowercase on insertion, which is also the only
/// form HTTP/3 allows on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    fields: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap { fields: Vec::new() }
    }

    /// Append a field, preserving existing entries with the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_ascii_lowercase(), value.to_string()));
    }

    /// Replace every field with this name by a single entry.
    pub fn set(&mut self, name: &str, value: &str) {
        let lower = name.to_ascii_lowercase();
        self.fields.retain(|(n, _)| *n != lower);
        self.fields.push((lower, value.to_string()));
    }

    /// First value for a name, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.fields
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for a name, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let lower = name.to_ascii_lowercase();
        self.fields
            .iter()
            .filter(|(n, _)| *n == lower)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        let lower = name.to_ascii_lowercase();
        self.fields.retain(|(n, _)| *n != lower);
    }

    /// All fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Merge `defaults` underneath this map: a default is added only when
    /// no field with that name exists yet.
    pub fn merge_defaults(&mut self, defaults: &HeaderMap) {
        for (name, value) in defaults.iter() {
            if !self.contains(name) {
                self.append(name, value);
            }
        }
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut map = HeaderMap::new();
        for (n, v) in iter {
            map.append(&n, &v);
        }
        map
    }
}

/// Build the request field list in HTTP/3 form: pseudo-headers first,
/// then regular fields, everything lowercase.
pub fn request_fields(
    method: &str,
    scheme: &str,
    authority: &str,
    path: &str,
    headers: &HeaderMap,
) -> Result<Vec<(String, String)>, H3Error> {
    if method.is_empty() || authority.is_empty() || path.is_empty() {
        return Err(H3Error::Message("empty pseudo-header value"));
    }
    let mut fields = Vec::with_capacity(headers.len() + 4);
    fields.push((":method".to_string(), method.to_string()));
    fields.push((":scheme".to_string(), scheme.to_string()));
    fields.push((":authority".to_string(), authority.to_string()));
    fields.push((":path".to_string(), path.to_string()));
    for (name, value) in headers.iter() {
        if name.starts_with(':') {
            return Err(H3Error::Message("pseudo-header in field map"));
        }
        // Connection-specific fields do not exist in HTTP/3.
        if matches!(
            name,
            "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
        ) {
            continue;
        }
        fields.push((name.to_string(), value.to_string()));
    }
    Ok(fields)
}

/// Split a decoded response section into (status, headers), validating
/// pseudo-header placement.
pub fn response_from_fields(
    fields: &[(String, String)],
) -> Result<(u16, HeaderMap), H3Error> {
    let mut status: Option<u16> = None;
    let mut headers = HeaderMap::new();
    let mut seen_regular = false;
    for (name, value) in fields {
        if let Some(pseudo) = name.strip_prefix(':') {
            if seen_regular {
                return Err(H3Error::Message("pseudo-header after regular field"));
            }
            match pseudo {
                "status" => {
                    if status.is_some() {
                        return Err(H3Error::Message("duplicate :status"));
                    }
                    status = value.parse().ok();
                    if status.is_none() {
                        return Err(H3Error::Message("unparsable :status"));
                    }
                }
                _ => return Err(H3Error::Message("unknown response pseudo-header")),
            }
        } else {
            seen_regular = true;
            headers.append(name, value);
        }
    }
    let status = status.ok_or(H3Error::Message("missing :status"))?;
    Ok((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut map = HeaderMap::new();
        map.append("Content-Type", "text/html");
        assert_eq!(map.get("content-type"), Some("text/html"));
        assert_eq!(map.get("CONTENT-TYPE"), Some("text/html"));
    }

    #[test]
    fn test_same_name_order_preserved() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", "a=1");
        map.append("x-other", "y");
        map.append("Set-Cookie", "b=2");
        assert_eq!(map.get_all("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_set_collapses_only_that_name() {
        let mut map = HeaderMap::new();
        map.append("accept", "text/html");
        map.append("accept", "image/png");
        map.append("host", "example.test");
        map.set("accept", "*/*");
        assert_eq!(map.get_all("accept"), vec!["*/*"]);
        assert_eq!(map.get("host"), Some("example.test"));
    }

    #[test]
    fn test_merge_defaults_per_request_wins() {
        let mut defaults = HeaderMap::new();
        defaults.append("user-agent", "quantum/1.0");
        defaults.append("accept-language", "en");

        let mut request = HeaderMap::new();
        request.append("user-agent", "custom/2.0");
        request.merge_defaults(&defaults);

        assert_eq!(request.get("user-agent"), Some("custom/2.0"));
        assert_eq!(request.get("accept-language"), Some("en"));
    }

    #[test]
    fn test_request_fields_pseudo_first_and_filtered() {
        let mut headers = HeaderMap::new();
        headers.append("connection", "keep-alive");
        headers.append("accept", "*/*");
        let fields =
            request_fields("GET", "https", "example.test", "/index.html", &headers).unwrap();
        assert_eq!(fields[0], (":method".to_string(), "GET".to_string()));
        assert_eq!(fields[3], (":path".to_string(), "/index.html".to_string()));
        assert!(fields.iter().all(|(n, _)| n != "connection"));
        assert!(fields.iter().any(|(n, _)| n == "accept"));
    }

    #[test]
    fn test_response_parse_and_validation() {
        let fields = vec![
            (":status".to_string(), "200".to_string()),
            ("content-type".to_string(), "text/html".to_string()),
        ];
        let (status, headers) = response_from_fields(&fields).unwrap();
        assert_eq!(status, 200);
        assert_eq!(headers.get("content-type"), Some("text/html"));

        let bad = vec![
            ("content-type".to_string(), "text/html".to_string()),
            (":status".to_string(), "200".to_string()),
        ];
        assert!(response_from_fields(&bad).is_err());

        assert!(response_from_fields(&[]).is_err());
    }
}
