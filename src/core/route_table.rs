//! Live routing table.
//!
//! Handlers are keyed by canonical path and never removed: a reload swaps the
//! definition inside an existing handler, registers new ones and disables the
//! paths that disappeared. Lookups never observe a half-applied reload for a
//! single route because each handler publishes its definition atomically.
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::core::route::RouteDefinition;

/// Stable per-path slot holding the current definition.
#[derive(Debug)]
pub struct RouteHandler {
    path: String,
    enabled: AtomicBool,
    definition: ArcSwap<RouteDefinition>,
}

impl RouteHandler {
    fn new(definition: Arc<RouteDefinition>) -> Self {
        Self {
            path: definition.path.clone(),
            enabled: AtomicBool::new(definition.enabled),
            definition: ArcSwap::new(definition),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Snapshot of the current definition.
    pub fn definition(&self) -> Arc<RouteDefinition> {
        self.definition.load_full()
    }

    fn publish(&self, definition: Arc<RouteDefinition>) {
        let enabled = definition.enabled;
        self.definition.store(definition);
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// A resolved request: the handler, the definition snapshot used for the whole
/// request, and the canonical URI.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub handler: Arc<RouteHandler>,
    pub definition: Arc<RouteDefinition>,
    /// Canonical route path
    pub path: String,
    /// Inbound query with pattern variables appended
    pub query: String,
}

impl RouteMatch {
    /// `path[?query]`, also used as the cache key.
    pub fn uri(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub added: usize,
    pub updated: usize,
    pub disabled: usize,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    handlers: scc::HashMap<String, Arc<RouteHandler>>,
    ordered: ArcSwap<Vec<Arc<RouteHandler>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a full set of definitions.
    ///
    /// Upserts happen before stale paths are disabled so a path present in both
    /// the old and the new set is never unavailable. Duplicate paths keep the
    /// position of their first occurrence and the content of the last one.
    pub async fn reload(&self, definitions: Vec<RouteDefinition>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut order = Vec::with_capacity(definitions.len());
        let mut fresh = HashSet::with_capacity(definitions.len());

        for definition in definitions {
            let path = definition.path.clone();
            let definition = Arc::new(definition);

            let existing = self
                .handlers
                .get_async(&path)
                .await
                .map(|entry| entry.get().clone());

            let handler = match existing {
                Some(handler) => {
                    handler.publish(definition);
                    summary.updated += 1;
                    handler
                }
                None => {
                    let handler = Arc::new(RouteHandler::new(definition));
                    let _ = self.handlers.insert_async(path.clone(), handler.clone()).await;
                    summary.added += 1;
                    handler
                }
            };

            if fresh.insert(path) {
                order.push(handler);
            }
        }

        self.ordered.store(Arc::new(order));

        let mut disabled = 0;
        self.handlers
            .retain_async(|path, handler| {
                if !fresh.contains(path) && handler.enabled.swap(false, Ordering::AcqRel) {
                    disabled += 1;
                }
                true
            })
            .await;
        summary.disabled = disabled;

        tracing::info!(
            added = summary.added,
            updated = summary.updated,
            disabled = summary.disabled,
            "Route table reloaded"
        );
        summary
    }

    pub async fn get(&self, path: &str) -> Option<Arc<RouteHandler>> {
        self.handlers
            .get_async(path)
            .await
            .map(|entry| entry.get().clone())
    }

    /// Routes of the last reload, in load order.
    pub fn routes(&self) -> Arc<Vec<Arc<RouteHandler>>> {
        self.ordered.load_full()
    }

    /// Resolve a request path.
    ///
    /// An exact, enabled path wins. Otherwise pattern routes are tried in load
    /// order and the first match is used; its variables are appended to the query.
    pub async fn match_request(&self, path: &str, query: Option<&str>) -> Option<RouteMatch> {
        let query = query.unwrap_or_default();

        if let Some(handler) = self.get(path).await.filter(|h| h.is_enabled()) {
            let definition = handler.definition();
            return Some(RouteMatch {
                path: definition.path.clone(),
                query: query.to_string(),
                handler,
                definition,
            });
        }

        let routes = self.ordered.load();
        for handler in routes.iter().filter(|h| h.is_enabled()) {
            let definition = handler.definition();
            let Some(variables) = definition
                .pattern
                .as_ref()
                .and_then(|pattern| pattern.captures(path))
            else {
                continue;
            };

            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(variables)
                .finish();
            let query = match (query.is_empty(), encoded.is_empty()) {
                (true, _) => encoded,
                (false, true) => query.to_string(),
                (false, false) => format!("{query}&{encoded}"),
            };

            return Some(RouteMatch {
                path: definition.path.clone(),
                query,
                handler: handler.clone(),
                definition,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::models::{RouteDocument, RouteSource};

    fn definition(path: &str, pattern: &str, name: &str) -> RouteDefinition {
        RouteDefinition::build(
            &RouteSource {
                file: PathBuf::from(format!("apis/{name}.json")),
                document: RouteDocument {
                    path: path.to_string(),
                    pattern: pattern.to_string(),
                    name: name.to_string(),
                    ..RouteDocument::default()
                },
                mock: None,
            },
            &[],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn exact_path_match() {
        let table = RouteTable::new();
        table.reload(vec![definition("/echo", "", "echo")]).await;

        let matched = table.match_request("/echo", Some("a=1")).await.unwrap();
        assert_eq!(matched.uri(), "/echo?a=1");
        assert!(table.match_request("/missing", None).await.is_none());
    }

    #[tokio::test]
    async fn pattern_variables_are_appended_to_query() {
        let table = RouteTable::new();
        table
            .reload(vec![definition("/user/get", "/user/:id", "user")])
            .await;

        let matched = table.match_request("/user/42", Some("x=1")).await.unwrap();
        assert_eq!(matched.path, "/user/get");
        assert_eq!(matched.query, "x=1&id=42");

        let matched = table.match_request("/user/7", None).await.unwrap();
        assert_eq!(matched.uri(), "/user/get?id=7");
    }

    #[tokio::test]
    async fn first_loaded_pattern_wins() {
        let table = RouteTable::new();
        table
            .reload(vec![
                definition("/first", "/item/:id", "first"),
                definition("/second", "/item/:code", "second"),
            ])
            .await;

        let matched = table.match_request("/item/9", None).await.unwrap();
        assert_eq!(matched.path, "/first");
    }

    #[tokio::test]
    async fn reload_keeps_handler_identity_and_disables_stale_paths() {
        let table = RouteTable::new();
        let summary = table
            .reload(vec![definition("/a", "", "a"), definition("/b", "", "b")])
            .await;
        assert_eq!(summary.added, 2);

        let before = table.get("/a").await.unwrap();

        let summary = table
            .reload(vec![definition("/a", "", "a2"), definition("/c", "", "c")])
            .await;
        assert_eq!(
            summary,
            ReloadSummary {
                added: 1,
                updated: 1,
                disabled: 1
            }
        );

        let after = table.get("/a").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.definition().document.name, "a2");

        assert!(table.match_request("/b", None).await.is_none());
        assert!(!table.get("/b").await.unwrap().is_enabled());

        table.reload(vec![definition("/b", "", "b")]).await;
        assert!(table.match_request("/b", None).await.is_some());
    }

    #[tokio::test]
    async fn disabled_document_is_not_routable() {
        let mut disabled = definition("/off", "", "off");
        disabled.enabled = false;

        let table = RouteTable::new();
        table.reload(vec![disabled]).await;

        assert!(table.match_request("/off", None).await.is_none());
        assert_eq!(table.routes().len(), 1);
    }

    #[tokio::test]
    async fn in_flight_snapshot_survives_reload() {
        let table = RouteTable::new();
        table.reload(vec![definition("/a", "", "old")]).await;

        let matched = table.match_request("/a", None).await.unwrap();
        table.reload(vec![definition("/a", "", "new")]).await;

        assert_eq!(matched.definition.document.name, "old");
        assert_eq!(matched.handler.definition().document.name, "new");
    }
}
