use std::{error::Error as StdError, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use eyre::Result;
use http_body_util::{BodyExt, LengthLimitError};
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tracing::Instrument;

use crate::{
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    tracing_setup::create_backend_span,
};

/// Upstream client built on Hyper with Rustls.
///
/// * Sets the `Host` header from the target URI
/// * Sends HTTP/1.1 on the wire
/// * Applies the route timeout to the whole exchange, body included
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        tracing::debug!("Loaded {} native root certificates", root_cert_store.len());

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        Ok(Self { client })
    }

    fn set_host_header(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let Some(host) = req.uri().host() else {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        };
        let value = match req.uri().port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let value = HeaderValue::from_str(&value)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(header::HOST, value);
        Ok(())
    }

    /// Map a client error, recognising an inbound body that hit its size limit.
    fn classify(error: &(dyn StdError + 'static)) -> HttpClientError {
        let mut source = Some(error);
        while let Some(e) = source {
            if e.is::<LengthLimitError>() {
                return HttpClientError::BodyTooLarge;
            }
            source = e.source();
        }
        HttpClientError::ConnectionError(error.to_string())
    }

    async fn exchange(&self, req: Request<AxumBody>) -> HttpClientResult<Response<Bytes>> {
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| Self::classify(&e))?;

        let (mut parts, body) = response.into_parts();
        parts.headers.remove(header::TRANSFER_ENCODING);

        let body = body
            .collect()
            .await
            .map_err(|e| HttpClientError::BodyError(e.to_string()))?
            .to_bytes();

        Ok(Response::from_parts(parts, body))
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
        timeout: Duration,
    ) -> HttpClientResult<Response<Bytes>> {
        Self::set_host_header(&mut req)?;
        *req.version_mut() = Version::HTTP_11;

        let span = create_backend_span(&req.uri().to_string(), req.method().as_str());

        match tokio::time::timeout(timeout, self.exchange(req))
            .instrument(span.clone())
            .await
        {
            Ok(Ok(response)) => {
                span.record("http.status_code", response.status().as_u16());
                Ok(response)
            }
            Ok(Err(e)) => {
                span.record("http.status_code", 599u16);
                tracing::warn!(error = %e, "Upstream request failed");
                Err(e)
            }
            Err(_) => {
                span.record("http.status_code", 504u16);
                tracing::warn!(?timeout, "Upstream request timed out");
                Err(HttpClientError::Timeout(timeout))
            }
        }
    }
}
