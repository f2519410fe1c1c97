//! Configuration data structures for the Meloy gateway.
//!
//! An application directory holds three kinds of documents:
//! * `config/app.json` ([`AppConfig`]): listener, access control, quotas, cache/stats/admin tuning
//! * `config/servers.json` (a list of [`ServerPool`]): upstream host pools with default limits
//! * `apis/**/*.json` ([`RouteDocument`]): one exposed endpoint per file
//!
//! All types are serde-friendly and carry defaults so that minimal documents stay short.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

/// Application level settings (`config/app.json`).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub ssl: SslConfig,
    pub allow: ClientList,
    pub deny: ClientList,
    pub limits: LimitsConfig,
    pub users: Vec<UserConfig>,
    pub cache: CacheConfig,
    pub stats: StatsConfig,
    pub admin: AdminConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ssl: SslConfig::default(),
            allow: ClientList::default(),
            deny: ClientList::default(),
            limits: LimitsConfig::default(),
            users: Vec::new(),
            cache: CacheConfig::default(),
            stats: StatsConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new application configuration builder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// `host:port` string handed to the listener.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// TLS is served only when both halves of the key pair are configured.
    pub fn tls_enabled(&self) -> bool {
        !self.ssl.cert.is_empty() && !self.ssl.key.is_empty()
    }
}

/// Builder for [`AppConfig`], mostly used by tests and embedders.
#[derive(Default)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn allow_client(mut self, client: impl Into<String>) -> Self {
        self.config.allow.clients.push(client.into());
        self
    }

    pub fn deny_client(mut self, client: impl Into<String>) -> Self {
        self.config.deny.clients.push(client.into());
        self
    }

    /// Set the per-minute and per-day request quotas (0 disables a window)
    pub fn request_limits(mut self, minute: u64, day: u64) -> Self {
        self.config.limits.requests = RequestLimits { minute, day };
        self
    }

    /// Add an `account` user accepted through the credential headers
    pub fn account(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.users.push(UserConfig {
            kind: "account".to_string(),
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn admin(mut self, admin: AdminConfig) -> Self {
        self.config.admin = admin;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

/// PEM certificate / key pair used for HTTPS.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SslConfig {
    pub cert: String,
    pub key: String,
}

/// A list of client addresses; entries are single IPs or CIDR ranges.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ClientList {
    pub clients: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LimitsConfig {
    pub requests: RequestLimits,
}

/// Global request quotas. Zero disables the window.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RequestLimits {
    pub minute: u64,
    pub day: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UserConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub username: String,
    pub password: String,
}

/// Response cache tuning.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry count above which the sweeper evicts half of the store
    pub max_entries: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10 * 1024 * 1024,
            sweep_interval_secs: 60,
        }
    }
}

/// Where aggregated statistics are flushed.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatsExporterKind {
    #[default]
    Log,
    File,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StatsConfig {
    pub flush_interval_secs: u64,
    pub exporter: StatsExporterKind,
    /// JSON-lines output, relative to the application directory
    pub file: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
            exporter: StatsExporterKind::Log,
            file: "data/stats.jsonl".to_string(),
        }
    }
}

/// The `/@` administrative surface.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub allow: ClientList,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow: ClientList::default(),
        }
    }
}

/// An upstream pool from `config/servers.json`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerPool {
    pub code: String,
    pub hosts: Vec<HostConfig>,
    pub request: PoolRequestConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct HostConfig {
    pub address: String,
    /// Negative weights are treated as zero
    pub weight: i64,
}

/// Pool-wide defaults applied to routes that leave them unset.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolRequestConfig {
    pub timeout: String,
    pub max_size: String,
}

/// One endpoint definition from `apis/**/*.json`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteDocument {
    pub is_enabled: bool,
    pub pattern: String,
    pub path: String,
    /// Template with `%{server.<code>}` and `%{api.path}` placeholders
    pub address: String,
    pub methods: Vec<String>,
    pub is_asynchronous: bool,
    pub response: ResponseDocument,
    pub headers: Vec<HeaderDocument>,
    pub timeout: String,
    pub max_size: String,

    pub name: String,
    pub description: String,
    pub params: Vec<ParamDocument>,
    pub dones: Vec<String>,
    pub todos: Vec<String>,
    pub is_deprecated: bool,
    pub version: String,
    pub roles: Vec<String>,
    pub author: String,
    pub company: String,
}

impl Default for RouteDocument {
    fn default() -> Self {
        Self {
            is_enabled: default_true(),
            pattern: String::new(),
            path: String::new(),
            address: String::new(),
            methods: Vec::new(),
            is_asynchronous: false,
            response: ResponseDocument::default(),
            headers: Vec::new(),
            timeout: String::new(),
            max_size: String::new(),
            name: String::new(),
            description: String::new(),
            params: Vec::new(),
            dones: Vec::new(),
            todos: Vec::new(),
            is_deprecated: false,
            version: String::new(),
            roles: Vec::new(),
            author: String::new(),
            company: String::new(),
        }
    }
}

impl RouteDocument {
    /// The canonical path: `path` when set, otherwise the raw pattern.
    pub fn effective_path(&self) -> &str {
        if self.path.is_empty() {
            &self.pattern
        } else {
            &self.path
        }
    }
}

/// Static body sources, checked in field order.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ResponseDocument {
    pub string: String,
    pub xml: String,
    /// Base64 encoded
    pub binary: String,
    pub json: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct HeaderDocument {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ParamDocument {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

/// A route document together with where it came from.
#[derive(Debug, Clone)]
pub struct RouteSource {
    pub file: PathBuf,
    pub document: RouteDocument,
    /// Content of the sibling `*.mock.json` file, if any
    pub mock: Option<String>,
}

/// Everything read from an application directory in one pass.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub app: AppConfig,
    pub servers: Vec<ServerPool>,
    pub routes: Vec<RouteSource>,
}
