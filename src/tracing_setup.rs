use eyre::Result;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Structured JSON logging, used by `serve`.
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()?;

    tracing::info!("Meloy structured logging initialized");
    Ok(())
}

/// Console-friendly logging, used by `debug`.
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()?;

    tracing::info!("Meloy console logging initialized");
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create an upstream call span
pub fn create_backend_span(backend_url: &str, method: &str) -> tracing::Span {
    tracing::info_span!(
        "backend_request",
        backend.url = backend_url,
        http.method = method,
        http.status_code = tracing::field::Empty,
    )
}
