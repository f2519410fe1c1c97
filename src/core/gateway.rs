//! Core gateway state.
//!
//! The `GatewayService` owns everything the request path reads: the route
//! table, the response cache, the hook chain, the access guard and the stats
//! recorder. It applies configuration snapshots:
//! * route documents are validated and compiled, broken ones are skipped
//! * an invalid `app.json` keeps the previous application settings
//! * reloads are serialized; requests keep running against the old snapshot
//!
//! This layer does no network I/O so it stays easy to test in isolation.
use std::sync::Arc;

use arc_swap::ArcSwap;
use eyre::{Result, eyre};
use tokio::sync::Mutex;

use crate::{
    config::{
        models::{AppConfig, ConfigSnapshot, ServerPool},
        validation::{
            AppConfigValidator, RouteDocumentValidator, ServerPoolValidator,
            format_multiple_errors,
        },
    },
    core::{
        access::AccessGuard,
        cache::ResponseCache,
        hooks::HookChain,
        route::RouteDefinition,
        route_table::{ReloadSummary, RouteTable},
        stats::StatsRecorder,
    },
    ports::{config_provider::ConfigProvider, stats::StatsSink},
};

pub struct GatewayService {
    app: ArcSwap<AppConfig>,
    access: ArcSwap<AccessGuard>,
    routes: RouteTable,
    cache: Arc<ResponseCache>,
    hooks: HookChain,
    stats: Arc<StatsRecorder>,
    provider: Option<Arc<dyn ConfigProvider>>,
    reload_lock: Mutex<()>,
}

impl GatewayService {
    pub fn new(app: AppConfig) -> Self {
        Self::with_stats(app, StatsRecorder::new())
    }

    pub fn with_stats(app: AppConfig, stats: StatsRecorder) -> Self {
        Self {
            access: ArcSwap::from_pointee(AccessGuard::from_config(&app)),
            cache: Arc::new(ResponseCache::new(app.cache.max_entries)),
            app: ArcSwap::from_pointee(app),
            routes: RouteTable::new(),
            hooks: HookChain::new(),
            stats: Arc::new(stats),
            provider: None,
            reload_lock: Mutex::new(()),
        }
    }

    /// Source used by [`reload`](Self::reload).
    pub fn with_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn app_config(&self) -> Arc<AppConfig> {
        self.app.load_full()
    }

    pub fn access(&self) -> Arc<AccessGuard> {
        self.access.load_full()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn hooks(&self) -> &HookChain {
        &self.hooks
    }

    pub fn stats(&self) -> &Arc<StatsRecorder> {
        &self.stats
    }

    pub fn stats_sink(&self) -> Arc<dyn StatsSink> {
        self.stats.clone()
    }

    /// Reload from the configured provider.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| eyre!("no configuration provider attached"))?;
        let snapshot = provider.load_snapshot().await?;
        Ok(self.apply_snapshot(snapshot).await)
    }

    /// Apply a snapshot. Concurrent calls are serialized.
    pub async fn apply_snapshot(&self, snapshot: ConfigSnapshot) -> ReloadSummary {
        let _guard = self.reload_lock.lock().await;

        match AppConfigValidator::validate(&snapshot.app) {
            Ok(()) => {
                self.cache.set_max_entries(snapshot.app.cache.max_entries);
                self.access
                    .store(Arc::new(AccessGuard::from_config(&snapshot.app)));
                self.app.store(Arc::new(snapshot.app.clone()));
            }
            Err(e) => tracing::error!(error = %e, "Keeping previous application settings"),
        }

        let definitions = Self::build_definitions(&snapshot);
        self.routes.reload(definitions).await
    }

    /// Validate and compile every route of a snapshot, skipping the broken ones.
    pub fn build_definitions(snapshot: &ConfigSnapshot) -> Vec<RouteDefinition> {
        let servers: Vec<ServerPool> = match ServerPoolValidator::validate(&snapshot.servers) {
            Ok(()) => snapshot.servers.clone(),
            Err(e) => {
                tracing::error!(error = %e, "Ignoring invalid server pools");
                Vec::new()
            }
        };

        if let Err(conflicts) = RouteDocumentValidator::check_route_conflicts(&snapshot.routes) {
            tracing::warn!("{}", format_multiple_errors(conflicts));
        }

        snapshot
            .routes
            .iter()
            .filter_map(|source| {
                if let Err(e) = RouteDocumentValidator::validate(&source.document) {
                    tracing::error!(file = %source.file.display(), error = %e, "Skipping route");
                    return None;
                }
                match RouteDefinition::build(source, &servers) {
                    Ok(definition) => {
                        if definition.pool.is_empty() {
                            tracing::warn!(
                                path = %definition.path,
                                address = %source.document.address,
                                "Route has no upstream address"
                            );
                        }
                        Some(definition)
                    }
                    Err(e) => {
                        tracing::error!(file = %source.file.display(), error = %e, "Skipping route");
                        None
                    }
                }
            })
            .collect()
    }
}
