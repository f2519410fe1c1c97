//! Tagged response cache with lazy expiry.
//!
//! Entries are keyed by request URI and indexed by tag so a whole group can be
//! invalidated at once. Expired entries are dropped when read and by the
//! periodic sweep; the sweep also evicts half of the store once it grows past
//! `max_entries`.
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http::HeaderMap;
use serde::Serialize;
use tokio::task::JoinHandle;

/// Maximum number of keys returned by [`ResponseCache::stat_tag`].
pub const TAG_SAMPLE_LIMIT: usize = 1000;

const SWEEP_BATCH: usize = 1024;

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Bytes,
    pub headers: HeaderMap,
    pub tags: Vec<String>,
    pub expires_at_ms: u64,
}

impl CacheEntry {
    fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagStat {
    pub count: usize,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

#[derive(Debug, Default)]
struct CacheStore {
    values: HashMap<String, CacheEntry>,
    tags: HashMap<String, HashSet<String>>,
}

impl CacheStore {
    /// Remove a key and its tag memberships, dropping emptied tag buckets.
    fn remove_key(&mut self, key: &str) -> bool {
        let Some(entry) = self.values.remove(key) else {
            return false;
        };
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct ResponseCache {
    store: RwLock<CacheStore>,
    max_entries: AtomicUsize,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: RwLock::new(CacheStore::default()),
            max_entries: AtomicUsize::new(max_entries),
        }
    }

    pub fn set_max_entries(&self, max_entries: usize) {
        self.max_entries.store(max_entries, Ordering::Relaxed);
    }

    fn read_store(&self) -> Option<RwLockReadGuard<'_, CacheStore>> {
        match self.store.read() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::error!("Cache lock poisoned, treating as miss");
                None
            }
        }
    }

    fn write_store(&self) -> Option<RwLockWriteGuard<'_, CacheStore>> {
        match self.store.write() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::error!("Cache lock poisoned, skipping write");
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_at(key, now_ms())
    }

    /// Look up a live entry; an expired one is removed and reported as absent.
    pub fn get_at(&self, key: &str, now_ms: u64) -> Option<CacheEntry> {
        {
            let store = self.read_store()?;
            let entry = store.values.get(key)?;
            if !entry.is_expired_at(now_ms) {
                return Some(entry.clone());
            }
        }

        let mut store = self.write_store()?;
        if store
            .values
            .get(key)
            .is_some_and(|entry| entry.is_expired_at(now_ms))
        {
            store.remove_key(key);
        }
        None
    }

    pub fn set(&self, key: &str, tags: &[String], body: Bytes, headers: HeaderMap, life_ms: u64) {
        self.set_at(key, tags, body, headers, life_ms, now_ms());
    }

    /// Store an entry for `life_ms`. A zero lifetime stores nothing.
    pub fn set_at(
        &self,
        key: &str,
        tags: &[String],
        body: Bytes,
        headers: HeaderMap,
        life_ms: u64,
        now_ms: u64,
    ) {
        if life_ms == 0 {
            return;
        }
        let Some(mut store) = self.write_store() else {
            return;
        };

        store.remove_key(key);

        let mut unique = Vec::with_capacity(tags.len());
        for tag in tags {
            if !unique.contains(tag) {
                unique.push(tag.clone());
            }
        }
        for tag in &unique {
            store
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }

        store.values.insert(
            key.to_string(),
            CacheEntry {
                body,
                headers,
                tags: unique,
                expires_at_ms: now_ms.saturating_add(life_ms),
            },
        );
    }

    /// Drop one entry and its tag memberships.
    pub fn delete(&self, key: &str) -> bool {
        self.write_store()
            .is_some_and(|mut store| store.remove_key(key))
    }

    /// Drop every entry carrying `tag`. Returns how many were removed.
    pub fn delete_tag(&self, tag: &str) -> usize {
        let Some(mut store) = self.write_store() else {
            return 0;
        };
        let Some(keys) = store.tags.remove(tag) else {
            return 0;
        };
        keys.iter().filter(|key| store.remove_key(key)).count()
    }

    pub fn clear_all(&self) -> usize {
        let Some(mut store) = self.write_store() else {
            return 0;
        };
        let count = store.values.len();
        store.values.clear();
        store.tags.clear();
        count
    }

    /// Size of a tag bucket with up to [`TAG_SAMPLE_LIMIT`] of its keys.
    /// `None` when no live bucket exists for the tag.
    pub fn stat_tag(&self, tag: &str) -> Option<TagStat> {
        let store = self.read_store()?;
        let keys = store.tags.get(tag)?;
        let mut sample: Vec<String> = keys.iter().take(TAG_SAMPLE_LIMIT).cloned().collect();
        sample.sort();
        Some(TagStat {
            count: keys.len(),
            keys: sample,
        })
    }

    pub fn len(&self) -> usize {
        self.read_store().map_or(0, |store| store.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(now_ms())
    }

    /// Remove expired entries, then evict half of the store if it is still
    /// above `max_entries`. Work is done in batches so readers are not starved.
    pub fn sweep_at(&self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();

        let expired: Vec<String> = match self.read_store() {
            Some(store) => store
                .values
                .iter()
                .filter(|(_, entry)| entry.is_expired_at(now_ms))
                .map(|(key, _)| key.clone())
                .collect(),
            None => return report,
        };

        for batch in expired.chunks(SWEEP_BATCH) {
            let Some(mut store) = self.write_store() else {
                return report;
            };
            for key in batch {
                if store
                    .values
                    .get(key)
                    .is_some_and(|entry| entry.is_expired_at(now_ms))
                    && store.remove_key(key)
                {
                    report.expired += 1;
                }
            }
        }

        let max_entries = self.max_entries.load(Ordering::Relaxed);
        let victims: Vec<String> = match self.read_store() {
            Some(store) if store.values.len() > max_entries => store
                .values
                .keys()
                .take(store.values.len() / 2)
                .cloned()
                .collect(),
            _ => Vec::new(),
        };

        for batch in victims.chunks(SWEEP_BATCH) {
            let Some(mut store) = self.write_store() else {
                return report;
            };
            report.evicted += batch.iter().filter(|key| store.remove_key(key)).count();
        }

        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = self.sweep();
                if report.expired > 0 || report.evicted > 0 {
                    tracing::debug!(
                        expired = report.expired,
                        evicted = report.evicted,
                        remaining = self.len(),
                        "Cache sweep finished"
                    );
                }
            }
        })
    }
}
