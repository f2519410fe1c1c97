//! Upstream response directives.
//!
//! An upstream may steer the gateway through `Meloy-Api-*` response headers.
//! Those headers are consumed here and never reach the client:
//!
//! | Header                       | Effect                                   |
//! |------------------------------|------------------------------------------|
//! | `Meloy-Api-Debug`            | recorded as a debug stat                 |
//! | `Meloy-Api-Cache-Life-Ms`    | cache the response for N milliseconds    |
//! | `Meloy-Api-Cache-Tag`        | add a tag to the cached response         |
//! | `Meloy-Api-Cache-Delete`     | invalidate a tag                         |
//!
//! Name matching is case-insensitive.
use http::{HeaderMap, HeaderName, header};

pub const DIRECTIVE_PREFIX: &str = "meloy-api-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Debug(String),
    CacheLifeMs(u64),
    CacheTag(String),
    CacheDelete(String),
    Unknown { name: String, value: String },
}

/// Interpret one header. Returns `None` when it is not a directive.
pub fn parse_directive(name: &str, value: &str) -> Option<Directive> {
    let lower = name.to_ascii_lowercase();
    let kind = lower.strip_prefix(DIRECTIVE_PREFIX)?;

    let directive = if kind.starts_with("debug") {
        Directive::Debug(value.to_string())
    } else if kind.starts_with("cache-life-ms") {
        match value.trim().parse::<i64>() {
            Ok(ms) => Directive::CacheLifeMs(ms.max(0) as u64),
            Err(_) => Directive::Unknown {
                name: name.to_string(),
                value: value.to_string(),
            },
        }
    } else if kind.starts_with("cache-tag") {
        Directive::CacheTag(value.to_string())
    } else if kind.starts_with("cache-delete") {
        Directive::CacheDelete(value.to_string())
    } else {
        Directive::Unknown {
            name: name.to_string(),
            value: value.to_string(),
        }
    };
    Some(directive)
}

/// Directives collected from one upstream response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseDirectives {
    pub debug: Vec<String>,
    pub cache_life_ms: u64,
    pub cache_tags: Vec<String>,
    pub cache_deletes: Vec<String>,
    pub unknown: Vec<(String, String)>,
}

impl ResponseDirectives {
    fn apply(&mut self, directive: Directive) {
        match directive {
            Directive::Debug(text) => self.debug.push(text),
            Directive::CacheLifeMs(ms) => self.cache_life_ms = ms,
            Directive::CacheTag(tag) => self.cache_tags.push(tag),
            Directive::CacheDelete(tag) => self.cache_deletes.push(tag),
            Directive::Unknown { name, value } => self.unknown.push((name, value)),
        }
    }
}

/// Headers that never travel from the upstream to the client as-is.
fn is_hop_header(name: &HeaderName, static_body: bool) -> bool {
    name == header::CONNECTION
        || name == header::SERVER
        || name == header::TRANSFER_ENCODING
        || name == header::CONTENT_LENGTH
        || name.as_str() == "keep-alive"
        || (static_body && name == header::CONTENT_ENCODING)
}

/// Split upstream headers into the client-facing set and the directives.
///
/// `Content-Encoding` is dropped as well when the route replaces the body.
pub fn split_response_headers(
    upstream: &HeaderMap,
    static_body: bool,
) -> (HeaderMap, ResponseDirectives) {
    let mut client = HeaderMap::with_capacity(upstream.len());
    let mut directives = ResponseDirectives::default();

    for (name, value) in upstream {
        let text = String::from_utf8_lossy(value.as_bytes());
        if let Some(directive) = parse_directive(name.as_str(), &text) {
            directives.apply(directive);
            continue;
        }
        if is_hop_header(name, static_body) {
            continue;
        }
        client.append(name.clone(), value.clone());
    }

    (client, directives)
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn parses_directive_kinds_case_insensitively() {
        assert_eq!(
            parse_directive("MELOY-API-CACHE-LIFE-MS", "1500"),
            Some(Directive::CacheLifeMs(1500))
        );
        assert_eq!(
            parse_directive("Meloy-Api-Cache-Tag", "users"),
            Some(Directive::CacheTag("users".into()))
        );
        assert_eq!(
            parse_directive("meloy-api-cache-delete", "users"),
            Some(Directive::CacheDelete("users".into()))
        );
        assert_eq!(
            parse_directive("Meloy-Api-Debug-Sql", "select 1"),
            Some(Directive::Debug("select 1".into()))
        );
        assert!(matches!(
            parse_directive("Meloy-Api-Whatever", "x"),
            Some(Directive::Unknown { .. })
        ));
        assert_eq!(parse_directive("Content-Type", "text/plain"), None);
        assert_eq!(parse_directive("Meloy-Api", "1.0"), None);
    }

    #[test]
    fn invalid_life_is_unknown() {
        assert!(matches!(
            parse_directive("Meloy-Api-Cache-Life-Ms", "soon"),
            Some(Directive::Unknown { .. })
        ));
        assert_eq!(
            parse_directive("Meloy-Api-Cache-Life-Ms", "-5"),
            Some(Directive::CacheLifeMs(0))
        );
    }

    #[test]
    fn split_strips_directives_and_hop_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("application/json"));
        upstream.insert("content-encoding", HeaderValue::from_static("gzip"));
        upstream.insert("server", HeaderValue::from_static("nginx"));
        upstream.insert("connection", HeaderValue::from_static("keep-alive"));
        upstream.insert("meloy-api-cache-life-ms", HeaderValue::from_static("5000"));
        upstream.append("meloy-api-cache-tag", HeaderValue::from_static("a"));
        upstream.append("meloy-api-cache-tag", HeaderValue::from_static("b"));
        upstream.insert("set-cookie", HeaderValue::from_static("k=v"));

        let (client, directives) = split_response_headers(&upstream, false);
        assert_eq!(client.len(), 3);
        assert_eq!(client["content-encoding"], "gzip");
        assert!(client.get("server").is_none());
        assert!(client.keys().all(|k| !k.as_str().starts_with(DIRECTIVE_PREFIX)));

        assert_eq!(directives.cache_life_ms, 5000);
        assert_eq!(directives.cache_tags, vec!["a".to_string(), "b".to_string()]);

        let (client, _) = split_response_headers(&upstream, true);
        assert!(client.get("content-encoding").is_none());
    }
}
