//! Request dispatch for application routes.
//!
//! For one inbound request the engine walks:
//! match → admission → method/size checks → hooks → cache → upstream →
//! directives → response → stats.
//! Every failure becomes an HTTP response; nothing here can take the listener down.
use std::{net::SocketAddr, sync::Arc};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{
    HeaderMap, Request, Response, StatusCode, Uri,
    header::{self, HeaderValue},
};

use crate::{
    core::{
        GatewayService,
        directives::{ResponseDirectives, split_response_headers},
        hooks::{HookContext, HookOutcome, HookRejection, HookRun},
        route::{RouteDefinition, UpstreamAddress, normalize_method},
        route_table::RouteMatch,
    },
    ports::{
        http_client::{HttpClient, HttpClientError},
        stats::{DebugRecord, StatRecord, StatsSink},
    },
};

/// `Server` header value on every proxied response.
pub const SERVER_NAME: &str = "MeloyApi";

/// Marker header stamped on every upstream request.
pub const MARKER_HEADER: &str = "meloy-api";
pub const MARKER_VALUE: &str = "1.0";

pub(crate) fn text_response(status: StatusCode, message: impl Into<String>) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn apply_route_headers(headers: &mut HeaderMap, route: &RouteDefinition) {
    for (name, value) in &route.headers {
        headers.insert(name.clone(), value.clone());
    }
}

fn finish(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn status_for(error: &HttpClientError) -> StatusCode {
    match error {
        HttpClientError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        HttpClientError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Forwards application routes to their upstreams.
#[derive(Clone)]
pub struct ProxyEngine {
    gateway: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
    stats: Arc<dyn StatsSink>,
}

impl ProxyEngine {
    pub fn new(gateway: Arc<GatewayService>, http_client: Arc<dyn HttpClient>) -> Self {
        let stats = gateway.stats_sink();
        Self {
            gateway,
            http_client,
            stats,
        }
    }

    /// Report stats somewhere other than the gateway's own recorder.
    pub fn with_stats_sink(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub async fn handle(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
        request_id: &str,
    ) -> Response<AxumBody> {
        let path = req.uri().path().to_string();
        let Some(matched) = self
            .gateway
            .routes()
            .match_request(&path, req.uri().query())
            .await
        else {
            return text_response(StatusCode::NOT_FOUND, format!("404 page not found ({path})"));
        };
        let route = matched.definition.clone();

        if let Err(denied) = self
            .gateway
            .access()
            .check(req.headers(), client_addr.map(|addr| addr.ip()))
        {
            tracing::info!(path = %route.path, reason = ?denied, "Request rejected");
            return text_response(StatusCode::FORBIDDEN, denied.to_string());
        }

        let Some(address) = route.pool.select() else {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "no available address");
        };

        if !route.allows_method(req.method()) {
            return text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("'{}' method is not supported", req.method()),
            );
        }

        if content_length(req.headers()).is_some_and(|len| len > route.max_body_bytes) {
            return text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large to upload",
            );
        }

        let (parts, body) = req.into_parts();
        let mut ctx = HookContext::new(
            normalize_method(&parts.method),
            matched.uri(),
            parts.headers,
            route.clone(),
        );
        ctx.request_id = request_id.to_string();
        ctx.client_addr = client_addr;
        ctx.address = Some(address.clone());

        let run = self.gateway.hooks().before(&mut ctx).await;
        if !run.proceeded() {
            let rejection = ctx.rejection.take().unwrap_or(HookRejection {
                status: StatusCode::FORBIDDEN,
                message: "Permission Denied".to_string(),
            });
            run.after(&mut ctx, HookOutcome::Stopped).await;
            return text_response(rejection.status, rejection.message);
        }

        let limit = usize::try_from(route.max_body_bytes).unwrap_or(usize::MAX);
        let body = Limited::new(body, limit);

        if !route.is_asynchronous {
            return self
                .forward(ctx, run, &matched, &address, AxumBody::new(body))
                .await;
        }

        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let status = if e.is::<LengthLimitError>() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                run.after(&mut ctx, HookOutcome::Failed(e.to_string())).await;
                return text_response(status, e.to_string());
            }
        };

        let engine = self.clone();
        let background = matched.clone();
        tokio::spawn(async move {
            engine
                .forward(ctx, run, &background, &address, AxumBody::from(bytes))
                .await;
        });

        let mut headers = HeaderMap::new();
        headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
        apply_route_headers(&mut headers, &route);
        finish(
            StatusCode::OK,
            headers,
            route.static_body.clone().unwrap_or_default(),
        )
    }

    async fn forward(
        &self,
        mut ctx: HookContext,
        run: HookRun,
        matched: &RouteMatch,
        address: &UpstreamAddress,
        body: AxumBody,
    ) -> Response<AxumBody> {
        let route = &matched.definition;
        let key = matched.uri();

        if let Some(entry) = self.gateway.cache().get(&key) {
            run.after(&mut ctx, HookOutcome::CacheHit).await;
            self.record(address, matched, &ctx, false, true);

            let mut headers = entry.headers;
            apply_route_headers(&mut headers, route);
            return finish(StatusCode::OK, headers, entry.body);
        }

        let target = if matched.query.is_empty() {
            address.url.clone()
        } else {
            format!("{}?{}", address.url, matched.query)
        };
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                let message = format!("invalid upstream address '{target}': {e}");
                tracing::error!(path = %route.path, "{message}");
                run.after(&mut ctx, HookOutcome::Failed(message.clone())).await;
                self.record(address, matched, &ctx, true, false);
                return text_response(StatusCode::BAD_GATEWAY, message);
            }
        };

        let mut outbound = Request::new(body);
        *outbound.method_mut() = ctx.method.clone();
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = ctx.headers.clone();
        outbound.headers_mut().remove(header::HOST);
        outbound
            .headers_mut()
            .insert(MARKER_HEADER, HeaderValue::from_static(MARKER_VALUE));

        let upstream = match self.http_client.send_request(outbound, route.timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                run.after(&mut ctx, HookOutcome::Failed(e.to_string())).await;
                self.record(address, matched, &ctx, true, false);
                return text_response(status_for(&e), e.to_string());
            }
        };

        let (parts, upstream_body) = upstream.into_parts();
        let status = parts.status;
        run.after(
            &mut ctx,
            HookOutcome::Upstream {
                status,
                headers: parts.headers.clone(),
            },
        )
        .await;

        let (mut headers, directives) =
            split_response_headers(&parts.headers, route.static_body.is_some());
        self.apply_directives(&directives, address, matched);

        headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
        apply_route_headers(&mut headers, route);

        let body = route.static_body.clone().unwrap_or(upstream_body);

        if directives.cache_life_ms > 0 {
            let mut tags = vec![route.cache_tag()];
            tags.extend(directives.cache_tags.iter().cloned());
            self.gateway.cache().set(
                &key,
                &tags,
                body.clone(),
                headers.clone(),
                directives.cache_life_ms,
            );
        }

        let failed = status != StatusCode::OK && status != StatusCode::CREATED;
        self.record(address, matched, &ctx, failed, false);

        finish(status, headers, body)
    }

    fn apply_directives(
        &self,
        directives: &ResponseDirectives,
        address: &UpstreamAddress,
        matched: &RouteMatch,
    ) {
        for body in &directives.debug {
            self.stats.send_debug(DebugRecord {
                server: address.server.clone(),
                host: address.host.clone(),
                path: matched.path.clone(),
                uri: matched.uri(),
                body: body.clone(),
                created_at: Utc::now(),
            });
        }

        for tag in &directives.cache_deletes {
            let removed = self.gateway.cache().delete_tag(tag);
            tracing::debug!(tag = %tag, removed, "Cache tag invalidated by upstream");
        }

        for (name, value) in &directives.unknown {
            tracing::warn!(header = %name, value = %value, path = %matched.path, "Unknown response directive");
        }
    }

    fn record(
        &self,
        address: &UpstreamAddress,
        matched: &RouteMatch,
        ctx: &HookContext,
        failed: bool,
        hit: bool,
    ) {
        self.stats.send(StatRecord {
            server: address.server.clone(),
            host: address.host.clone(),
            path: matched.path.clone(),
            uri: matched.uri(),
            elapsed_ms: ctx.elapsed().as_millis() as u64,
            errors: u64::from(failed),
            hits: u64::from(hit),
        });
    }
}
