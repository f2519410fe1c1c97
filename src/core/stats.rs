//! In-memory statistics aggregation.
//!
//! Requests are folded into per-`server$$host$$path` aggregates until the next
//! flush hands them to a [`StatsExporter`]. Cumulative per-route totals are kept
//! separately for the admin listing and survive flushes.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::ports::stats::{
    DebugRecord, StatData, StatRecord, StatsBatch, StatsExporter, StatsSink,
};

/// Cumulative figures for one route path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStat {
    pub avg_ms: f64,
    pub requests: u64,
    pub hits: u64,
    pub errors: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct RouteTotals {
    total_ms: u64,
    requests: u64,
    hits: u64,
    errors: u64,
}

#[derive(Debug, Default)]
struct Pending {
    data: HashMap<String, StatData>,
    debug: Vec<DebugRecord>,
}

#[derive(Debug, Default)]
pub struct StatsRecorder {
    pending: Mutex<Pending>,
    totals: Mutex<HashMap<String, RouteTotals>>,
    verbose: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn stat_key(server: &str, host: &str, path: &str) -> String {
    format!("{server}$${host}$${path}")
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every record as it arrives.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Cumulative totals for `path`.
    pub fn route_stat(&self, path: &str) -> RouteStat {
        let totals = lock(&self.totals);
        let Some(t) = totals.get(path) else {
            return RouteStat::default();
        };
        RouteStat {
            avg_ms: if t.requests == 0 {
                0.0
            } else {
                t.total_ms as f64 / t.requests as f64
            },
            requests: t.requests,
            hits: t.hits,
            errors: t.errors,
        }
    }

    /// Aggregates not flushed yet.
    pub fn pending(&self) -> Vec<StatData> {
        let mut data: Vec<StatData> = lock(&self.pending).data.values().cloned().collect();
        data.sort_by(|a, b| (&a.path, &a.server, &a.host).cmp(&(&b.path, &b.server, &b.host)));
        data
    }

    pub fn pending_debug(&self) -> Vec<DebugRecord> {
        lock(&self.pending).debug.clone()
    }

    /// Pending debug payloads for one route path, oldest first.
    pub fn debug_for(&self, path: &str) -> Vec<DebugRecord> {
        lock(&self.pending)
            .debug
            .iter()
            .filter(|record| record.path == path)
            .cloned()
            .collect()
    }

    /// Drop the pending debug payloads of one route path. Returns how many were dropped.
    pub fn discard_debug(&self, path: &str) -> usize {
        let mut pending = lock(&self.pending);
        let before = pending.debug.len();
        pending.debug.retain(|record| record.path != path);
        before - pending.debug.len()
    }

    /// Take everything accumulated since the last drain.
    pub fn drain(&self) -> StatsBatch {
        let pending = std::mem::take(&mut *lock(&self.pending));
        let mut data: Vec<StatData> = pending.data.into_values().collect();
        data.sort_by(|a, b| (&a.path, &a.server, &a.host).cmp(&(&b.path, &b.server, &b.host)));
        StatsBatch {
            flushed_at: Utc::now(),
            data,
            debug: pending.debug,
        }
    }

    /// Drain and export. A failed export is reported and the batch is dropped.
    pub async fn flush(&self, exporter: &dyn StatsExporter) -> eyre::Result<usize> {
        let batch = self.drain();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.data.len() + batch.debug.len();
        exporter.export(&batch).await?;
        tracing::debug!(exporter = exporter.name(), records = count, "Stats flushed");
        Ok(count)
    }

    /// Flush every `interval` until the task is aborted.
    pub fn spawn_flusher(
        self: Arc<Self>,
        exporter: Arc<dyn StatsExporter>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush(exporter.as_ref()).await {
                    tracing::error!(exporter = exporter.name(), error = %e, "Stats export failed");
                }
            }
        })
    }
}

impl StatsSink for StatsRecorder {
    fn send(&self, record: StatRecord) {
        if self.verbose {
            tracing::info!(
                server = %record.server,
                host = %record.host,
                uri = %record.uri,
                elapsed_ms = record.elapsed_ms,
                errors = record.errors,
                hits = record.hits,
                "stat"
            );
        }

        {
            let mut totals = lock(&self.totals);
            let t = totals.entry(record.path.clone()).or_default();
            t.total_ms += record.elapsed_ms;
            t.requests += 1;
            t.hits += record.hits;
            t.errors += record.errors;
        }

        let mut pending = lock(&self.pending);
        let key = stat_key(&record.server, &record.host, &record.path);
        let data = pending.data.entry(key).or_insert_with(|| StatData {
            server: record.server,
            host: record.host,
            path: record.path,
            ..StatData::default()
        });
        data.total_ms += record.elapsed_ms;
        data.requests += 1;
        data.errors += record.errors;
        data.hits += record.hits;
    }

    fn send_debug(&self, record: DebugRecord) {
        if self.verbose {
            tracing::info!(uri = %record.uri, body = %record.body, "debug stat");
        }
        lock(&self.pending).debug.push(record);
    }
}
