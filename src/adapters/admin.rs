//! The `/@` administrative surface.
//!
//! Every endpoint answers with a JSON envelope `{code, message, data}`; the
//! HTTP status mirrors `code`. Append `_pretty=true` to the query for indented
//! output. Access is limited to `admin.allow.clients`, loopback always allowed.
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use axum::body::Body as AxumBody;
use hyper::{Request, Response, StatusCode, header, header::HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    adapters::proxy::text_response,
    config::models::RouteDocument,
    core::{
        GatewayService, RouteDefinition,
        access::{ClientFilter, IpNetwork},
        route::{UpstreamAddress, route_cache_tag},
        route_table::RouteHandler,
        stats::RouteStat,
    },
};

pub const ADMIN_PREFIX: &str = "/@";

static ROUTE_DEBUG_LOGS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/@api/\[(.+)\]/debug/logs$").expect("admin debug logs regex is valid")
});
static ROUTE_DEBUG_FLUSH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/@api/\[(.+)\]/debug/flush$").expect("admin debug flush regex is valid")
});
static ROUTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/@api/\[(.+)\]$").expect("admin route regex is valid"));
static ROUTE_CACHE_CLEAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/@cache/\[(.+)\]/clear$").expect("admin cache clear regex is valid")
});
static TAG_DELETE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/@cache/tag/(.+)/delete$").expect("admin tag delete regex is valid"));
static TAG_STAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/@cache/tag/(.+)$").expect("admin tag regex is valid"));

#[derive(Serialize)]
struct Envelope {
    code: u16,
    message: String,
    data: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RouteView<'a> {
    #[serde(flatten)]
    document: &'a RouteDocument,
    active: bool,
    file: String,
    has_mock: bool,
    available_addresses: Vec<&'a UpstreamAddress>,
    stat: RouteStat,
}

pub struct AdminSurface {
    gateway: Arc<GatewayService>,
}

impl AdminSurface {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }

    pub fn is_admin_path(path: &str) -> bool {
        path.starts_with(ADMIN_PREFIX)
    }

    fn client_allowed(&self, client_addr: Option<SocketAddr>) -> bool {
        let app = self.gateway.app_config();
        let allow: Vec<IpNetwork> = app
            .admin
            .allow
            .clients
            .iter()
            .filter_map(|c| IpNetwork::parse(c).ok())
            .collect();
        if allow.is_empty() {
            return true;
        }

        let Some(ip) = client_addr.map(|a| a.ip().to_canonical()) else {
            return false;
        };
        if ip == IpAddr::V4(Ipv4Addr::LOCALHOST) || ip == IpAddr::V6(Ipv6Addr::LOCALHOST) {
            return true;
        }
        ClientFilter::new(allow, Vec::new()).permits(Some(ip))
    }

    pub async fn handle(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let pretty = req.uri().query().is_some_and(|q| {
            url::form_urlencoded::parse(q.as_bytes()).any(|(k, v)| k == "_pretty" && v == "true")
        });

        if !self.client_allowed(client_addr) {
            tracing::warn!(client = ?client_addr, "Admin access denied");
            return envelope(StatusCode::UNAUTHORIZED, "Forbidden", Value::Null, pretty);
        }

        let path = req.uri().path();
        tracing::debug!(path, "Admin request");

        match path {
            "/@api" => envelope(
                StatusCode::OK,
                "",
                json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }),
                pretty,
            ),
            "/@api/all" => self.list_routes(pretty),
            "/@api/reload" => self.reload(pretty).await,
            "/@cache/clear" => {
                let count = self.gateway.cache().clear_all();
                envelope(StatusCode::OK, "", json!({ "count": count }), pretty)
            }
            _ if path.starts_with("/@mock/") => self.mock(&path["/@mock".len()..]).await,
            _ => {
                if let Some(route_path) = capture(&ROUTE_DEBUG_LOGS_RE, path) {
                    let records = self.gateway.stats().debug_for(&route_path);
                    return envelope(StatusCode::OK, "", json!(records), pretty);
                }
                if let Some(route_path) = capture(&ROUTE_DEBUG_FLUSH_RE, path) {
                    let count = self.gateway.stats().discard_debug(&route_path);
                    return envelope(StatusCode::OK, "", json!({ "count": count }), pretty);
                }
                if let Some(route_path) = capture(&ROUTE_RE, path) {
                    return self.show_route(&route_path, pretty).await;
                }
                if let Some(route_path) = capture(&ROUTE_CACHE_CLEAR_RE, path) {
                    let count = self.gateway.cache().delete_tag(&route_cache_tag(&route_path));
                    return envelope(StatusCode::OK, "", json!({ "count": count }), pretty);
                }
                if let Some(tag) = capture(&TAG_DELETE_RE, path) {
                    let count = self.gateway.cache().delete_tag(&tag);
                    return envelope(StatusCode::OK, "", json!({ "count": count }), pretty);
                }
                if let Some(tag) = capture(&TAG_STAT_RE, path) {
                    return match self.gateway.cache().stat_tag(&tag) {
                        Some(stat) => envelope(StatusCode::OK, "", json!(stat), pretty),
                        None => envelope(
                            StatusCode::NOT_FOUND,
                            &format!("tag '{tag}' not found"),
                            Value::Null,
                            pretty,
                        ),
                    };
                }
                envelope(StatusCode::NOT_FOUND, "not found", Value::Null, pretty)
            }
        }
    }

    fn view<'a>(&self, handler: &RouteHandler, definition: &'a RouteDefinition) -> RouteView<'a> {
        RouteView {
            document: &definition.document,
            active: handler.is_enabled(),
            file: definition.file.display().to_string(),
            has_mock: definition.mock.is_some(),
            available_addresses: definition.pool.entries().collect(),
            stat: self.gateway.stats().route_stat(&definition.path),
        }
    }

    fn list_routes(&self, pretty: bool) -> Response<AxumBody> {
        let handlers = self.gateway.routes().routes();
        let definitions: Vec<_> = handlers.iter().map(|h| (h, h.definition())).collect();
        let views: Vec<RouteView<'_>> = definitions
            .iter()
            .map(|(handler, definition)| self.view(handler, definition))
            .collect();
        envelope(StatusCode::OK, "", json!(views), pretty)
    }

    async fn show_route(&self, path: &str, pretty: bool) -> Response<AxumBody> {
        let Some(handler) = self.gateway.routes().get(path).await else {
            return envelope(
                StatusCode::NOT_FOUND,
                &format!("api '{path}' not found"),
                Value::Null,
                pretty,
            );
        };
        let definition = handler.definition();
        let view = self.view(&handler, &definition);
        envelope(StatusCode::OK, "", json!(view), pretty)
    }

    async fn reload(&self, pretty: bool) -> Response<AxumBody> {
        match self.gateway.reload().await {
            Ok(summary) => envelope(StatusCode::OK, "reloaded", json!(summary), pretty),
            Err(e) => {
                tracing::error!(error = %e, "Admin reload failed");
                envelope(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &e.to_string(),
                    Value::Null,
                    pretty,
                )
            }
        }
    }

    async fn mock(&self, path: &str) -> Response<AxumBody> {
        let mock = match self.gateway.routes().get(path).await {
            Some(handler) => handler.definition().mock_text(),
            None => None,
        };
        match mock {
            Some(text) => {
                let mut response = text_response(StatusCode::OK, text);
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json; charset=utf-8"),
                );
                response
            }
            None => text_response(
                StatusCode::NOT_FOUND,
                format!("mock data for '{path}' not found"),
            ),
        }
    }
}

fn capture(re: &Regex, path: &str) -> Option<String> {
    let raw = re.captures(path)?.get(1)?.as_str();
    Some(
        urlencoding::decode(raw)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw.to_string()),
    )
}

fn envelope(status: StatusCode, message: &str, data: Value, pretty: bool) -> Response<AxumBody> {
    let body = Envelope {
        code: status.as_u16(),
        message: message.to_string(),
        data,
    };
    let text = if pretty {
        serde_json::to_string_pretty(&body)
    } else {
        serde_json::to_string(&body)
    };

    match text {
        Ok(text) => {
            let mut response = Response::new(AxumBody::from(text));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bytes::Bytes;
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        config::models::{AdminConfig, AppConfig, ClientList, ConfigSnapshot, RouteSource},
        ports::stats::{DebugRecord, StatsSink},
    };

    async fn surface(admin: AdminConfig) -> (AdminSurface, Arc<GatewayService>) {
        let app = AppConfig::builder().admin(admin).build();
        let gateway = Arc::new(GatewayService::new(app.clone()));
        gateway
            .apply_snapshot(ConfigSnapshot {
                app,
                servers: Vec::new(),
                routes: vec![RouteSource {
                    file: PathBuf::from("apis/user.json"),
                    document: RouteDocument {
                        path: "/user/get".into(),
                        name: "Get user".into(),
                        address: "%{server.api}".into(),
                        methods: vec!["GET".into()],
                        ..RouteDocument::default()
                    },
                    mock: Some("{\n  // the id\n  \"id\": 1\n}".into()),
                }],
            })
            .await;
        (AdminSurface::new(gateway.clone()), gateway)
    }

    async fn call(admin: &AdminSurface, uri: &str, client: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(uri).body(AxumBody::empty()).unwrap();
        let response = admin.handle(req, Some(client.parse().unwrap())).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn lists_routes_with_stats() {
        let (admin, _) = surface(AdminConfig::default()).await;
        let (status, body) = call(&admin, "/@api/all", "10.0.0.1:1000").await;
        assert_eq!(status, StatusCode::OK);

        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["code"], 200);
        assert_eq!(value["data"][0]["path"], "/user/get");
        assert_eq!(value["data"][0]["name"], "Get user");
        assert_eq!(value["data"][0]["stat"]["requests"], 0);
        assert_eq!(value["data"][0]["hasMock"], true);
    }

    #[tokio::test]
    async fn shows_single_route_and_404s_unknown() {
        let (admin, _) = surface(AdminConfig::default()).await;
        let (status, body) = call(&admin, "/@api/[/user/get]", "10.0.0.1:1000").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"Get user\""));

        let (status, _) = call(&admin, "/@api/[/nope]", "10.0.0.1:1000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mock_strips_comments() {
        let (admin, _) = surface(AdminConfig::default()).await;
        let (status, body) = call(&admin, "/@mock/user/get", "10.0.0.1:1000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{\n  \"id\": 1\n}");

        let (status, body) = call(&admin, "/@mock/none", "10.0.0.1:1000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("/none"));
    }

    #[tokio::test]
    async fn cache_endpoints() {
        let (admin, gateway) = surface(AdminConfig::default()).await;
        let cache = gateway.cache();
        let tags = vec![route_cache_tag("/user/get"), "users".to_string()];
        cache.set("/user/get?id=1", &tags, Bytes::from_static(b"x"), Default::default(), 60_000);
        cache.set("/user/get?id=2", &tags, Bytes::from_static(b"y"), Default::default(), 60_000);

        let (_, body) = call(&admin, "/@cache/tag/users", "10.0.0.1:1000").await;
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["data"]["count"], 2);

        let (_, body) = call(&admin, "/@cache/[/user/get]/clear", "10.0.0.1:1000").await;
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["data"]["count"], 2);

        let (status, _) = call(&admin, "/@cache/tag/users", "10.0.0.1:1000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        cache.set("/a", &["t".to_string()], Bytes::from_static(b"z"), Default::default(), 60_000);
        let (_, body) = call(&admin, "/@cache/clear?_pretty=true", "10.0.0.1:1000").await;
        assert!(body.contains("\n"));
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["data"]["count"], 1);
    }

    #[tokio::test]
    async fn debug_logs_listed_and_flushed_per_route() {
        let (admin, gateway) = surface(AdminConfig::default()).await;
        for (path, body) in [("/user/get", "slow query"), ("/other", "x"), ("/user/get", "retry")] {
            gateway.stats().send_debug(DebugRecord {
                server: "api".into(),
                host: "http://10.0.0.9".into(),
                path: path.into(),
                uri: format!("{path}?id=1"),
                body: body.into(),
                created_at: chrono::Utc::now(),
            });
        }

        let (status, body) = call(&admin, "/@api/[/user/get]/debug/logs", "10.0.0.1:1000").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["data"].as_array().unwrap().len(), 2);
        assert_eq!(value["data"][0]["body"], "slow query");
        assert_eq!(value["data"][1]["uri"], "/user/get?id=1");

        let (_, body) = call(&admin, "/@api/[/user/get]/debug/flush", "10.0.0.1:1000").await;
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["data"]["count"], 2);

        let (_, body) = call(&admin, "/@api/[/user/get]/debug/logs", "10.0.0.1:1000").await;
        let value: Value = serde_json::from_str(&body).unwrap();
        assert!(value["data"].as_array().unwrap().is_empty());
        assert_eq!(gateway.stats().pending_debug().len(), 1);
    }

    #[tokio::test]
    async fn allow_list_guards_admin_but_not_loopback() {
        let (admin, _) = surface(AdminConfig {
            enabled: true,
            allow: ClientList {
                clients: vec!["192.168.0.0/24".into()],
            },
        })
        .await;

        let (status, body) = call(&admin, "/@api", "10.0.0.1:1000").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Forbidden"));

        let (status, _) = call(&admin, "/@api", "192.168.0.7:1000").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&admin, "/@api", "[::1]:1000").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn reload_without_provider_reports_error() {
        let (admin, _) = surface(AdminConfig::default()).await;
        let (status, body) = call(&admin, "/@api/reload", "10.0.0.1:1000").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("no configuration provider"));
    }
}
