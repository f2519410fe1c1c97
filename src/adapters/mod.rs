pub mod admin;
pub mod config_providers;
pub mod http_client;
pub mod http_handler;
pub mod proxy;
pub mod stats_exporters;

/// Re-export commonly used types from adapters
pub use admin::AdminSurface;
pub use config_providers::FileConfigProvider;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use proxy::ProxyEngine;
pub use stats_exporters::{JsonLinesStatsExporter, LogStatsExporter};
