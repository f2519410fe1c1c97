//! Meloy - a declarative API gateway.
//!
//! Every exposed endpoint is a JSON document under `apis/`: a path or path
//! pattern, an upstream address template over weighted server pools, limits,
//! and an optional static response. The gateway matches inbound requests
//! against those documents, forwards them to a weighted-random upstream host
//! and lets the upstream steer the gateway through `Meloy-Api-*` response
//! directives (response caching by tag, cache invalidation, debug payloads).
//!
//! # Features
//! - Exact and regex pattern routes with hot reload that keeps handler identity
//! - Weighted upstream pools expanded from `%{server.<code>}` templates
//! - Tag-indexed response cache with lazy expiry and a periodic sweeper
//! - Before/after hooks that can short-circuit a request
//! - Credential headers, client allow/deny lists and minute/day quotas
//! - Per-endpoint statistics flushed to a pluggable exporter
//! - A `/@` admin surface for introspection, reload and cache control
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use meloy_gateway::{GatewayService, HttpClientAdapter, HttpHandler, config::loader};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let snapshot = loader::load_snapshot("./app").await?;
//! let gateway = Arc::new(GatewayService::new(snapshot.app.clone()));
//! gateway.apply_snapshot(snapshot).await;
//!
//! let handler = HttpHandler::new(gateway, Arc::new(HttpClientAdapter::new()?));
//! // Mount `handler.handle_request` on any hyper/axum listener.
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Business logic lives in `core` and does no network I/O. `ports` declares the
//! traits the core talks through (outbound HTTP, configuration source, stats
//! export) and `adapters` implements them along with the inbound HTTP surface.
//!
//! # Error Handling
//! Library APIs return `eyre::Result<T>` or a `thiserror` domain error. Request
//! handling never fails outward: every failure becomes an HTTP response.
//!
//! # Concurrency & Data Structures
//! The route table uses `scc::HashMap` for lookups and `arc_swap` for the
//! per-handler definitions, so reloads never block request dispatch.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{FileConfigProvider, HttpClientAdapter, HttpHandler},
    core::{GatewayService, Hook, HookContext, HookFlow},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
