//! Compiled route definitions.
//!
//! A [`RouteDefinition`] is built once per reload from a [`RouteSource`] and the
//! loaded server pools. Everything the request path needs is resolved up front:
//! the anchored path matcher, the weighted upstream pool, methods, limits, the
//! static body and the response headers.
use std::{path::PathBuf, sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::models::{RouteDocument, RouteSource, ServerPool},
    core::units::{self, UnitError},
};

/// Timeout used when neither the route nor its server pool sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Body limit used when neither the route nor its server pool sets one.
pub const DEFAULT_MAX_BODY_BYTES: u64 = 32 << 20;

/// Prefix of the cache tag every cached response of a route carries.
pub const ROUTE_TAG_PREFIX: &str = "$MeloyAPI$";

/// Copies per unit of relative weight when expanding a pool.
const WEIGHT_MULTIPLICITY: f64 = 10.0;

static VARIABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":(?:(\w+)(\s*(\([^)]+\))?))").expect("variable regex is valid"));

static MOCK_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*//.+").expect("mock comment regex is valid"));

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route has neither 'path' nor 'pattern'")]
    MissingPath,

    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error(transparent)]
    Unit(#[from] UnitError),
}

/// The cache tag shared by every response cached for `path`.
pub fn route_cache_tag(path: &str) -> String {
    format!("{ROUTE_TAG_PREFIX}{path}")
}

/// A `:name` / `:name(regex)` pattern compiled into an anchored matcher.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
    names: Vec<String>,
}

impl PathPattern {
    /// Compile a pattern. Returns `Ok(None)` when it declares no variables,
    /// in which case the route is matched by exact path only.
    pub fn compile(pattern: &str) -> Result<Option<Self>, RouteError> {
        let mut names = Vec::new();
        let expanded = VARIABLE_RE.replace_all(pattern, |caps: &regex::Captures<'_>| {
            names.push(caps[1].to_string());
            caps.get(3)
                .map_or_else(|| r"(\w+)".to_string(), |m| m.as_str().to_string())
        });

        if names.is_empty() {
            return Ok(None);
        }

        let regex =
            Regex::new(&format!("^{expanded}$")).map_err(|source| RouteError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;

        Ok(Some(Self {
            source: pattern.to_string(),
            regex,
            names,
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Match `path` and return the captured variables in declaration order.
    pub fn captures(&self, path: &str) -> Option<Vec<(String, String)>> {
        let caps = self.regex.captures(path)?;
        Some(
            self.names
                .iter()
                .enumerate()
                .map(|(index, name)| {
                    let value = caps.get(index + 1).map_or("", |m| m.as_str());
                    (name.clone(), value.to_string())
                })
                .collect(),
        )
    }
}

/// One resolved upstream location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamAddress {
    pub server: String,
    pub host: String,
    pub url: String,
}

/// Weighted upstream pool, expanded so that uniform selection follows the weights.
#[derive(Debug, Clone, Default)]
pub struct AddressPool {
    entries: Vec<Arc<UpstreamAddress>>,
}

impl AddressPool {
    pub fn new(entries: Vec<UpstreamAddress>) -> Self {
        Self {
            entries: entries.into_iter().map(Arc::new).collect(),
        }
    }

    /// Expand `pool` for an address template.
    ///
    /// With a total weight of zero every host appears once; otherwise each host
    /// contributes `round(weight * 10 / total)` copies. Negative weights count as zero.
    pub fn expand(template: &str, route_path: &str, pool: &ServerPool) -> Vec<UpstreamAddress> {
        let placeholder = format!("%{{server.{}}}", pool.code);
        if pool.hosts.is_empty() || !template.contains(&placeholder) {
            return Vec::new();
        }

        let total: i64 = pool.hosts.iter().map(|h| h.weight.max(0)).sum();
        let mut entries = Vec::new();

        for host in &pool.hosts {
            let address = UpstreamAddress {
                server: pool.code.clone(),
                host: host.address.clone(),
                url: template
                    .replace(&placeholder, &host.address)
                    .replace("%{api.path}", route_path),
            };

            let copies = if total == 0 {
                1
            } else if host.weight <= 0 {
                0
            } else {
                let share = host.weight as f64 * WEIGHT_MULTIPLICITY / total as f64;
                (share.round() as usize).max(1)
            };
            entries.extend(std::iter::repeat_n(address, copies));
        }

        entries
    }

    /// Pick one entry uniformly at random; no randomness for a single entry.
    pub fn select(&self) -> Option<Arc<UpstreamAddress>> {
        match self.entries.len() {
            0 => None,
            1 => self.entries.first().cloned(),
            len => self.entries.get(rand::rng().random_range(0..len)).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &UpstreamAddress> {
        self.entries.iter().map(|e| e.as_ref())
    }
}

/// Compiled representation of one endpoint.
#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub path: String,
    pub pattern: Option<PathPattern>,
    pub pool: AddressPool,
    pub methods: Vec<Method>,
    pub timeout: Duration,
    pub max_body_bytes: u64,
    pub static_body: Option<Bytes>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub mock: Option<String>,
    pub is_asynchronous: bool,
    pub enabled: bool,
    pub document: RouteDocument,
    pub file: PathBuf,
}

impl RouteDefinition {
    /// Resolve a route document against the loaded server pools.
    pub fn build(source: &RouteSource, servers: &[ServerPool]) -> Result<Self, RouteError> {
        let document = &source.document;

        let path = document.effective_path().to_string();
        if path.is_empty() {
            return Err(RouteError::MissingPath);
        }

        let pattern = if document.pattern.is_empty() {
            None
        } else {
            PathPattern::compile(&document.pattern)?
        };

        let methods = document
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_uppercase().as_bytes())
                    .map_err(|_| RouteError::InvalidMethod(m.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut timeout = units::parse_duration(&document.timeout)?;
        let mut max_body_bytes = units::parse_size(&document.max_size)?;

        let mut entries = Vec::new();
        for pool in servers {
            let expanded = AddressPool::expand(&document.address, &path, pool);
            if expanded.is_empty() {
                continue;
            }
            entries.extend(expanded);

            if timeout.is_zero() {
                timeout = units::parse_duration(&pool.request.timeout).unwrap_or_default();
            }
            if max_body_bytes == 0 {
                max_body_bytes = units::parse_size(&pool.request.max_size).unwrap_or_default();
            }
        }

        if timeout.is_zero() {
            timeout = DEFAULT_TIMEOUT;
        }
        if max_body_bytes == 0 {
            max_body_bytes = DEFAULT_MAX_BODY_BYTES;
        }

        let headers = document
            .headers
            .iter()
            .map(|h| {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|_| RouteError::InvalidHeader(h.name.clone()))?;
                let value = HeaderValue::from_str(&h.value)
                    .map_err(|_| RouteError::InvalidHeader(h.name.clone()))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, RouteError>>()?;

        Ok(Self {
            path,
            pattern,
            pool: AddressPool::new(entries),
            methods,
            timeout,
            max_body_bytes,
            static_body: static_body(document),
            headers,
            mock: source.mock.clone(),
            is_asynchronous: document.is_asynchronous,
            enabled: document.is_enabled,
            document: document.clone(),
            file: source.file.clone(),
        })
    }

    /// Case-insensitive: `get` is accepted where `GET` is configured.
    pub fn allows_method(&self, method: &Method) -> bool {
        let method = normalize_method(method);
        self.methods.iter().any(|m| *m == method)
    }

    pub fn cache_tag(&self) -> String {
        route_cache_tag(&self.path)
    }

    /// Mock text with `//` comment lines removed.
    pub fn mock_text(&self) -> Option<String> {
        self.mock
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(|m| MOCK_COMMENT_RE.replace_all(m, "").into_owned())
    }
}

/// Upper-case form of a request method; standard methods come back as their constants.
pub fn normalize_method(method: &Method) -> Method {
    let upper = method.as_str().to_ascii_uppercase();
    if upper == method.as_str() {
        return method.clone();
    }
    Method::from_bytes(upper.as_bytes()).unwrap_or_else(|_| method.clone())
}

fn static_body(document: &RouteDocument) -> Option<Bytes> {
    let response = &document.response;
    if !response.string.is_empty() {
        return Some(Bytes::from(response.string.clone()));
    }
    if !response.xml.is_empty() {
        return Some(Bytes::from(response.xml.clone()));
    }
    if !response.binary.is_empty() {
        return match STANDARD.decode(response.binary.as_bytes()) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                tracing::warn!(path = %document.effective_path(), error = %e, "Ignoring undecodable binary response");
                None
            }
        };
    }
    response
        .json
        .as_ref()
        .and_then(|value| serde_json::to_vec(value).ok())
        .map(Bytes::from)
}
