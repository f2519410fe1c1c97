use std::path::PathBuf;

use async_trait::async_trait;
use eyre::{Context, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::ports::stats::{DebugRecord, StatData, StatsBatch, StatsExporter};

/// Writes each aggregate as a structured log event.
#[derive(Debug, Default)]
pub struct LogStatsExporter;

#[async_trait]
impl StatsExporter for LogStatsExporter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn export(&self, batch: &StatsBatch) -> Result<()> {
        for data in &batch.data {
            tracing::info!(
                target: "meloy::stats",
                server = %data.server,
                host = %data.host,
                path = %data.path,
                requests = data.requests,
                total_ms = data.total_ms,
                errors = data.errors,
                hits = data.hits,
                "stat"
            );
        }
        for record in &batch.debug {
            tracing::info!(
                target: "meloy::stats",
                server = %record.server,
                uri = %record.uri,
                body = %record.body,
                "debug"
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum Line<'a> {
    Stat {
        flushed_at: String,
        #[serde(flatten)]
        data: &'a StatData,
    },
    Debug {
        flushed_at: String,
        #[serde(flatten)]
        record: &'a DebugRecord,
    },
}

/// Appends one JSON object per aggregate to a file.
#[derive(Debug)]
pub struct JsonLinesStatsExporter {
    path: PathBuf,
}

impl JsonLinesStatsExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn render(batch: &StatsBatch) -> Result<String> {
        let flushed_at = batch.flushed_at.to_rfc3339();
        let mut out = String::new();
        for data in &batch.data {
            out.push_str(&serde_json::to_string(&Line::Stat {
                flushed_at: flushed_at.clone(),
                data,
            })?);
            out.push('\n');
        }
        for record in &batch.debug {
            out.push_str(&serde_json::to_string(&Line::Debug {
                flushed_at: flushed_at.clone(),
                record,
            })?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl StatsExporter for JsonLinesStatsExporter {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn export(&self, batch: &StatsBatch) -> Result<()> {
        let text = Self::render(batch)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .wrap_err_with(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
