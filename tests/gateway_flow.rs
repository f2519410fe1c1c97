use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, Uri},
    response::Response,
    routing::{any, get},
};
use http_body_util::BodyExt;
use meloy_gateway::{
    GatewayService, HttpClientAdapter, HttpHandler,
    adapters::FileConfigProvider,
    config::models::{AppConfig, ConfigSnapshot, HostConfig, RouteDocument, RouteSource, ServerPool},
    core::hooks::{Hook, HookContext, HookFlow, HookRejection},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: String) -> Json<Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "method": method.as_str(),
        "uri": uri.to_string(),
        "marker": header("meloy-api"),
        "host": header("host"),
        "body": body,
    }))
}

/// Start an upstream on an ephemeral port and return its base URL.
async fn spawn_upstream(name: &'static str) -> String {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/echo", any(echo))
        .route(
            "/cached",
            get(move || {
                let hits = hits.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    (
                        [
                            ("meloy-api-cache-life-ms", "60000"),
                            ("meloy-api-cache-tag", "items"),
                            ("x-upstream", name),
                        ],
                        format!("fresh-{n}"),
                    )
                }
            }),
        )
        .route("/who", get(move || async move { name }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn pool(code: &str, hosts: &[(&str, i64)]) -> ServerPool {
    ServerPool {
        code: code.into(),
        hosts: hosts
            .iter()
            .map(|(address, weight)| HostConfig {
                address: address.to_string(),
                weight: *weight,
            })
            .collect(),
        ..ServerPool::default()
    }
}

fn route(path: &str, methods: &[&str]) -> RouteDocument {
    RouteDocument {
        path: path.into(),
        address: "%{server.api}%{api.path}".into(),
        methods: methods.iter().map(|m| m.to_string()).collect(),
        ..RouteDocument::default()
    }
}

fn snapshot(app: AppConfig, servers: Vec<ServerPool>, routes: Vec<RouteDocument>) -> ConfigSnapshot {
    ConfigSnapshot {
        app,
        servers,
        routes: routes
            .into_iter()
            .map(|document| RouteSource {
                file: PathBuf::from(format!("apis{}.json", document.path)),
                document,
                mock: None,
            })
            .collect(),
    }
}

async fn gateway(snapshot: ConfigSnapshot) -> (HttpHandler, Arc<GatewayService>) {
    let gateway = Arc::new(GatewayService::new(snapshot.app.clone()));
    gateway.apply_snapshot(snapshot).await;
    let client = Arc::new(HttpClientAdapter::new().unwrap());
    (HttpHandler::new(gateway.clone(), client), gateway)
}

fn client() -> Option<SocketAddr> {
    Some("127.0.0.1:50000".parse().unwrap())
}

async fn send(handler: &HttpHandler, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let response: Response<Body> = handler.handle_request(req, client()).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn get_path(handler: &HttpHandler, uri: &str) -> (StatusCode, HeaderMap, String) {
    send(
        handler,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await
}

#[tokio::test]
async fn forwards_with_marker_header_and_query() {
    let upstream = spawn_upstream("a").await;
    let (handler, gateway) = gateway(snapshot(
        AppConfig::default(),
        vec![pool("api", &[(&upstream, 1)])],
        vec![route("/echo", &["GET", "POST"])],
    ))
    .await;

    let (status, headers, body) = get_path(&handler, "/echo?x=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["server"], "MeloyApi");

    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["uri"], "/echo?x=1");
    assert_eq!(value["marker"], "1.0");
    assert_eq!(value["host"], upstream.trim_start_matches("http://"));

    let (status, _, body) = send(
        &handler,
        Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["method"], "POST");
    assert_eq!(value["body"], "hello");

    let stat = gateway.stats().route_stat("/echo");
    assert_eq!(stat.requests, 2);
    assert_eq!(stat.errors, 0);
}

#[tokio::test]
async fn cache_directives_are_applied_and_stripped() {
    let upstream = spawn_upstream("a").await;
    let (handler, gateway) = gateway(snapshot(
        AppConfig::default(),
        vec![pool("api", &[(&upstream, 1)])],
        vec![route("/cached", &["GET"])],
    ))
    .await;

    let (status, headers, body) = get_path(&handler, "/cached").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "fresh-1");
    assert_eq!(headers["x-upstream"], "a");
    assert!(headers.get("meloy-api-cache-life-ms").is_none());
    assert!(headers.get("meloy-api-cache-tag").is_none());

    let (status, headers, body) = get_path(&handler, "/cached").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "fresh-1");
    assert_eq!(headers["x-upstream"], "a");

    assert_eq!(gateway.cache().stat_tag("items").unwrap().count, 1);
    assert_eq!(gateway.stats().route_stat("/cached").hits, 1);

    assert_eq!(gateway.cache().delete_tag("items"), 1);
    let (_, _, body) = get_path(&handler, "/cached").await;
    assert_eq!(body, "fresh-2");
}

#[tokio::test]
async fn minute_quota_rejects_third_request() {
    let upstream = spawn_upstream("a").await;
    let app = AppConfig::builder().request_limits(2, 0).build();
    let (handler, _) = gateway(snapshot(
        app,
        vec![pool("api", &[(&upstream, 1)])],
        vec![route("/who", &["GET"])],
    ))
    .await;

    assert_eq!(get_path(&handler, "/who").await.0, StatusCode::OK);
    assert_eq!(get_path(&handler, "/who").await.0, StatusCode::OK);

    let (status, _, body) = get_path(&handler, "/who").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "API requests limit reached");
}

#[tokio::test]
async fn credentials_are_required_when_accounts_exist() {
    let upstream = spawn_upstream("a").await;
    let app = AppConfig::builder().account("alice", "secret").build();
    let (handler, _) = gateway(snapshot(
        app,
        vec![pool("api", &[(&upstream, 1)])],
        vec![route("/who", &["GET"])],
    ))
    .await;

    assert_eq!(get_path(&handler, "/who").await.0, StatusCode::FORBIDDEN);

    let (status, _, body) = send(
        &handler,
        Request::builder()
            .uri("/who")
            .header("Meloy-Username", "alice")
            .header("Meloy-Password", "secret")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "a");
}

#[tokio::test]
async fn reload_keeps_handler_identity() {
    let upstream = spawn_upstream("a").await;
    let servers = vec![pool("api", &[(&upstream, 1)])];
    let (_, gateway) = gateway(snapshot(
        AppConfig::default(),
        servers.clone(),
        vec![route("/echo", &["GET"]), route("/who", &["GET"])],
    ))
    .await;

    let before = gateway.routes().get("/echo").await.unwrap();

    let summary = gateway
        .apply_snapshot(snapshot(
            AppConfig::default(),
            servers,
            vec![route("/echo", &["GET", "POST"])],
        ))
        .await;
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.disabled, 1);

    let after = gateway.routes().get("/echo").await.unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(after.definition().allows_method(&Method::POST));
    assert!(gateway.routes().match_request("/who", None).await.is_none());
}

struct DenyAll;

#[async_trait]
impl Hook for DenyAll {
    fn name(&self) -> &str {
        "deny_all"
    }

    async fn before(&self, ctx: &mut HookContext) -> HookFlow {
        ctx.rejection = Some(HookRejection {
            status: StatusCode::UNAUTHORIZED,
            message: "blocked by hook".into(),
        });
        HookFlow::Stop
    }
}

#[tokio::test]
async fn hook_short_circuits_before_upstream() {
    let upstream = spawn_upstream("a").await;
    let (handler, gateway) = gateway(snapshot(
        AppConfig::default(),
        vec![pool("api", &[(&upstream, 1)])],
        vec![route("/who", &["GET"])],
    ))
    .await;
    gateway.hooks().add_hook(Arc::new(DenyAll));

    let (status, _, body) = get_path(&handler, "/who").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "blocked by hook");
}

#[tokio::test]
async fn weighted_pool_prefers_heavier_host() {
    let heavy = spawn_upstream("heavy").await;
    let light = spawn_upstream("light").await;
    let (handler, _) = gateway(snapshot(
        AppConfig::default(),
        vec![pool("api", &[(&heavy, 3), (&light, 1)])],
        vec![route("/who", &["GET"])],
    ))
    .await;

    let mut heavy_count = 0;
    let mut light_count = 0;
    for _ in 0..200 {
        match get_path(&handler, "/who").await.2.as_str() {
            "heavy" => heavy_count += 1,
            "light" => light_count += 1,
            other => panic!("unexpected upstream {other}"),
        }
    }
    assert!(light_count > 0);
    assert!(heavy_count > light_count);
}

#[tokio::test]
async fn admin_surface_is_served_on_the_same_handler() {
    let upstream = spawn_upstream("a").await;
    let (handler, _) = gateway(snapshot(
        AppConfig::default(),
        vec![pool("api", &[(&upstream, 1)])],
        vec![route("/who", &["GET"])],
    ))
    .await;

    get_path(&handler, "/who").await;

    let (status, _, body) = get_path(&handler, "/@api/all").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["code"], 200);
    assert_eq!(value["data"][0]["path"], "/who");
    assert_eq!(value["data"][0]["stat"]["requests"], 1);
}

#[tokio::test]
async fn unknown_path_is_404() {
    let (handler, _) = gateway(snapshot(AppConfig::default(), vec![], vec![])).await;
    let (status, _, body) = get_path(&handler, "/nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "404 page not found (/nothing)");
}

#[tokio::test]
async fn reload_from_application_directory() {
    let upstream = spawn_upstream("a").await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("config")).unwrap();
    std::fs::create_dir_all(dir.path().join("apis/user")).unwrap();
    std::fs::write(
        dir.path().join("config/app.json"),
        "{\n  // listener\n  \"port\": 8000\n}",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("config/servers.json"),
        json!([{ "code": "api", "hosts": [{ "address": upstream, "weight": 1 }] }]).to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("apis/user/who.json"),
        json!({ "path": "/who", "address": "%{server.api}%{api.path}", "methods": ["GET"] })
            .to_string(),
    )
    .unwrap();

    let provider = Arc::new(FileConfigProvider::new(dir.path()));
    let gateway = Arc::new(GatewayService::new(AppConfig::default()).with_provider(provider));
    let summary = gateway.reload().await.unwrap();
    assert_eq!(summary.added, 1);

    let handler = HttpHandler::new(gateway.clone(), Arc::new(HttpClientAdapter::new().unwrap()));
    let (status, _, body) = get_path(&handler, "/who").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "a");

    std::fs::write(
        dir.path().join("apis/user/who.json"),
        json!({ "path": "/who", "address": "%{server.api}%{api.path}", "methods": ["POST"] })
            .to_string(),
    )
    .unwrap();
    let summary = gateway.reload().await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(get_path(&handler, "/who").await.0, StatusCode::METHOD_NOT_ALLOWED);
}
