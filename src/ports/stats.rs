//! Statistics ports: the sink the request path writes to and the exporter the
//! periodic flush hands aggregated batches to.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One finished request as seen by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRecord {
    pub server: String,
    pub host: String,
    pub path: String,
    pub uri: String,
    pub elapsed_ms: u64,
    pub errors: u64,
    pub hits: u64,
}

/// Free-form debug payload emitted by an upstream through `Meloy-Api-Debug*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugRecord {
    pub server: String,
    pub host: String,
    pub path: String,
    pub uri: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate for one `server$$host$$path` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatData {
    pub server: String,
    pub host: String,
    pub path: String,
    pub total_ms: u64,
    pub requests: u64,
    pub errors: u64,
    pub hits: u64,
}

/// Everything accumulated between two flushes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsBatch {
    pub flushed_at: DateTime<Utc>,
    pub data: Vec<StatData>,
    pub debug: Vec<DebugRecord>,
}

impl StatsBatch {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.debug.is_empty()
    }
}

/// Non-blocking recorder used on the request path.
pub trait StatsSink: Send + Sync + 'static {
    fn send(&self, record: StatRecord);

    fn send_debug(&self, record: DebugRecord);
}

/// Destination of flushed batches.
#[async_trait]
pub trait StatsExporter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn export(&self, batch: &StatsBatch) -> eyre::Result<()>;
}
