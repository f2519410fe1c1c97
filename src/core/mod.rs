pub mod access;
pub mod cache;
pub mod directives;
pub mod gateway;
pub mod hooks;
pub mod route;
pub mod route_table;
pub mod stats;
pub mod units;

pub use access::AccessGuard;
pub use cache::ResponseCache;
pub use gateway::GatewayService;
pub use hooks::{Hook, HookChain, HookContext, HookFlow};
pub use route::RouteDefinition;
pub use route_table::RouteTable;
pub use stats::StatsRecorder;
