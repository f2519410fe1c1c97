use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    adapters::{admin::AdminSurface, proxy::ProxyEngine},
    core::GatewayService,
    ports::http_client::HttpClient,
    tracing_setup::create_request_span,
};

/// HTTP entry point: the `/@` admin surface or an application route.
#[derive(Clone)]
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
    proxy: ProxyEngine,
    admin: Arc<AdminSurface>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            proxy: ProxyEngine::new(gateway.clone(), http_client),
            admin: Arc::new(AdminSurface::new(gateway.clone())),
            gateway,
        }
    }

    pub fn gateway(&self) -> &Arc<GatewayService> {
        &self.gateway
    }

    /// Main request handler. Failures are turned into responses by the
    /// engines; the `Result` is kept for the listener's error fallback.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, eyre::Error> {
        let request_id = Uuid::new_v4().to_string();
        let span = create_request_span(req.method().as_str(), req.uri().path(), &request_id);
        let started = Instant::now();

        async move {
            let admin_enabled = self.gateway.app_config().admin.enabled;
            let response = if admin_enabled && AdminSurface::is_admin_path(req.uri().path()) {
                self.admin.handle(req, client_addr).await
            } else {
                self.proxy.handle(req, client_addr, &request_id).await
            };

            let current = tracing::Span::current();
            current.record("http.status_code", response.status().as_u16());
            current.record("duration_ms", started.elapsed().as_millis() as u64);
            tracing::debug!("Request finished");

            Ok(response)
        }
        .instrument(span)
        .await
    }
}
