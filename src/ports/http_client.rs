use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for upstream HTTP calls
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connecting to or talking with the upstream failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// No complete response within the route timeout
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// The outbound request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The inbound body exceeded the route limit while streaming
    #[error("Request body exceeds the route limit")]
    BodyTooLarge,

    /// Reading the upstream response body failed
    #[error("Body error: {0}")]
    BodyError(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Port for forwarding a request to an upstream.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send `req` and collect the full response.
    ///
    /// `timeout` bounds the whole exchange, including reading the response body.
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        timeout: Duration,
    ) -> HttpClientResult<Response<Bytes>>;
}
