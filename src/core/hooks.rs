//! Request hooks.
//!
//! Hooks run in registration order before a request is forwarded and may
//! rewrite the outbound headers or stop the request. After the exchange the
//! hooks whose `before` let the request through run in reverse order.
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};

use crate::core::route::{RouteDefinition, UpstreamAddress};

/// Whether a `before` hook lets the request continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    Proceed,
    Stop,
}

/// Response a hook wants returned when it stops a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRejection {
    pub status: StatusCode,
    pub message: String,
}

/// How the exchange ended, visible to `after` hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Upstream answered; `headers` are its raw response headers, directives included.
    Upstream { status: StatusCode, headers: HeaderMap },
    CacheHit,
    Failed(String),
    Stopped,
}

/// Per-request state shared by the hook chain.
#[derive(Debug)]
pub struct HookContext {
    pub request_id: String,
    pub method: Method,
    /// Canonical `path[?query]`
    pub uri: String,
    /// Headers that will be sent upstream
    pub headers: HeaderMap,
    pub client_addr: Option<SocketAddr>,
    pub route: Arc<RouteDefinition>,
    pub address: Option<Arc<UpstreamAddress>>,
    pub rejection: Option<HookRejection>,
    pub outcome: Option<HookOutcome>,
    pub started_at: Instant,
}

impl HookContext {
    pub fn new(method: Method, uri: String, headers: HeaderMap, route: Arc<RouteDefinition>) -> Self {
        Self {
            request_id: String::new(),
            method,
            uri,
            headers,
            client_addr: None,
            route,
            address: None,
            rejection: None,
            outcome: None,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[async_trait]
pub trait Hook: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn before(&self, _ctx: &mut HookContext) -> HookFlow {
        HookFlow::Proceed
    }

    async fn after(&self, _ctx: &HookContext) {}
}

type HookList = Vec<Arc<dyn Hook>>;

/// Ordered hook registry.
#[derive(Default)]
pub struct HookChain {
    hooks: ArcSwap<HookList>,
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.hooks.load();
        f.debug_list()
            .entries(hooks.iter().map(|h| h.name().to_string()))
            .finish()
    }
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&self, hook: Arc<dyn Hook>) {
        tracing::debug!(hook = hook.name(), "Registering hook");
        self.hooks.rcu(|hooks| {
            let mut next = HookList::clone(hooks);
            next.push(hook.clone());
            next
        });
    }

    pub fn len(&self) -> usize {
        self.hooks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `before` hooks until one stops the request.
    pub async fn before(&self, ctx: &mut HookContext) -> HookRun {
        let hooks = self.hooks.load_full();
        let mut passed = 0;

        for hook in hooks.iter() {
            match hook.before(ctx).await {
                HookFlow::Proceed => passed += 1,
                HookFlow::Stop => {
                    tracing::debug!(hook = hook.name(), uri = %ctx.uri, "Hook stopped request");
                    return HookRun {
                        hooks,
                        passed,
                        proceeded: false,
                    };
                }
            }
        }

        HookRun {
            hooks,
            passed,
            proceeded: true,
        }
    }
}

/// Result of the `before` pass, used to drive the matching `after` pass.
pub struct HookRun {
    hooks: Arc<HookList>,
    passed: usize,
    proceeded: bool,
}

impl HookRun {
    pub fn proceeded(&self) -> bool {
        self.proceeded
    }

    /// Number of hooks whose `before` let the request through.
    pub fn passed(&self) -> usize {
        self.passed
    }

    /// Record the outcome and run `after` in reverse over the passed hooks.
    pub async fn after(&self, ctx: &mut HookContext, outcome: HookOutcome) {
        ctx.outcome = Some(outcome);
        for hook in self.hooks[..self.passed].iter().rev() {
            hook.after(ctx).await;
        }
    }
}

/// Logs every forwarded request and how it ended.
#[derive(Debug, Default)]
pub struct AccessLogHook;

#[async_trait]
impl Hook for AccessLogHook {
    fn name(&self) -> &str {
        "access_log"
    }

    async fn before(&self, ctx: &mut HookContext) -> HookFlow {
        tracing::debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            uri = %ctx.uri,
            upstream = ctx.address.as_ref().map(|a| a.url.as_str()).unwrap_or_default(),
            "Dispatching request"
        );
        HookFlow::Proceed
    }

    async fn after(&self, ctx: &HookContext) {
        let elapsed_ms = ctx.elapsed().as_millis() as u64;
        match &ctx.outcome {
            Some(HookOutcome::Upstream { status, .. }) => tracing::info!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                uri = %ctx.uri,
                status = status.as_u16(),
                elapsed_ms,
                "Request completed"
            ),
            Some(HookOutcome::CacheHit) => tracing::info!(
                request_id = %ctx.request_id,
                uri = %ctx.uri,
                elapsed_ms,
                "Served from cache"
            ),
            Some(HookOutcome::Failed(error)) => tracing::warn!(
                request_id = %ctx.request_id,
                uri = %ctx.uri,
                error = %error,
                elapsed_ms,
                "Request failed"
            ),
            Some(HookOutcome::Stopped) | None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Mutex};

    use super::*;
    use crate::config::models::{RouteDocument, RouteSource};

    struct Recording {
        name: &'static str,
        stop: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Hook for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn before(&self, ctx: &mut HookContext) -> HookFlow {
            self.log.lock().unwrap().push(format!("{}.before", self.name));
            ctx.headers
                .insert("x-hooked", http::HeaderValue::from_static("1"));
            if self.stop {
                HookFlow::Stop
            } else {
                HookFlow::Proceed
            }
        }

        async fn after(&self, _ctx: &HookContext) {
            self.log.lock().unwrap().push(format!("{}.after", self.name));
        }
    }

    fn context() -> HookContext {
        let route = RouteDefinition::build(
            &RouteSource {
                file: PathBuf::from("apis/x.json"),
                document: RouteDocument {
                    path: "/x".into(),
                    ..RouteDocument::default()
                },
                mock: None,
            },
            &[],
        )
        .unwrap();
        HookContext::new(Method::GET, "/x".into(), HeaderMap::new(), Arc::new(route))
    }

    fn chain(stops: &[(&'static str, bool)], log: &Arc<Mutex<Vec<String>>>) -> HookChain {
        let chain = HookChain::new();
        for (name, stop) in stops {
            chain.add_hook(Arc::new(Recording {
                name: *name,
                stop: *stop,
                log: log.clone(),
            }));
        }
        chain
    }

    #[tokio::test]
    async fn after_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&[("a", false), ("b", false)], &log);
        let mut ctx = context();

        let run = chain.before(&mut ctx).await;
        assert!(run.proceeded());
        assert_eq!(ctx.headers["x-hooked"], "1");

        run.after(&mut ctx, HookOutcome::CacheHit).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a.before", "b.before", "b.after", "a.after"]
        );
        assert_eq!(ctx.outcome, Some(HookOutcome::CacheHit));
    }

    #[tokio::test]
    async fn stop_skips_later_hooks_and_its_own_after() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&[("a", false), ("b", true), ("c", false)], &log);
        let mut ctx = context();

        let run = chain.before(&mut ctx).await;
        assert!(!run.proceeded());
        assert_eq!(run.passed(), 1);

        run.after(&mut ctx, HookOutcome::Stopped).await;
        assert_eq!(*log.lock().unwrap(), vec!["a.before", "b.before", "a.after"]);
    }

    #[tokio::test]
    async fn empty_chain_proceeds() {
        let chain = HookChain::new();
        let mut ctx = context();
        let run = chain.before(&mut ctx).await;
        assert!(run.proceeded());
        assert!(chain.is_empty());
    }
}
