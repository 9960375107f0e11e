// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sticky execution cache.
//!
//! A process-wide bounded mapping from run id to cached
//! [`WorkflowExecutionContext`], with LRU eviction. Sticky execution keeps
//! the partially-replayed state of a run on the worker so subsequent tasks
//! only deliver new events. The cost is memory; the bound and the eviction
//! hook keep it honest. Evicting a running execution must tell the server to
//! drop its sticky affinity, otherwise the next delta task would be
//! undecodable - that is the eviction hook's job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::context::WorkflowExecutionContext;

/// Default capacity of the process-wide cache.
pub const DEFAULT_STICKY_CACHE_SIZE: usize = 10_000;

static STICKY_CACHE: OnceCell<Arc<WorkflowCache>> = OnceCell::new();
static STICKY_CACHE_SIZE: Mutex<usize> = Mutex::new(DEFAULT_STICKY_CACHE_SIZE);

/// Set the process-wide sticky cache capacity.
///
/// Must be called before any worker starts; the capacity of a live cache
/// cannot change.
///
/// # Panics
///
/// Panics if the cache has already been created.
pub fn set_sticky_cache_size(size: usize) {
    let mut guard = STICKY_CACHE_SIZE.lock().expect("sticky cache size lock");
    if STICKY_CACHE.get().is_some() {
        panic!("cache already created, set the cache size before any worker starts");
    }
    *guard = size;
}

/// The process-wide sticky cache, created lazily on first access.
pub fn sticky_cache() -> Arc<WorkflowCache> {
    STICKY_CACHE
        .get_or_init(|| {
            let size = *STICKY_CACHE_SIZE.lock().expect("sticky cache size lock");
            Arc::new(WorkflowCache::new(size))
        })
        .clone()
}

struct CacheEntry {
    context: Arc<WorkflowExecutionContext>,
    last_access: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    access_counter: u64,
}

/// Bounded LRU mapping from run id to execution context.
///
/// Internally synchronized; the lock is never held across await points, so
/// the async eviction hooks run outside it.
pub struct WorkflowCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl WorkflowCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                access_counter: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Look up a context, touching its recency.
    pub fn get(&self, run_id: &str) -> Option<Arc<WorkflowExecutionContext>> {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.access_counter += 1;
        let counter = inner.access_counter;
        let entry = inner.entries.get_mut(run_id)?;
        entry.last_access = counter;
        Some(entry.context.clone())
    }

    /// Insert if absent. Returns the context now cached under the run id
    /// (the existing one on a race) and the LRU victim displaced to make
    /// room, if any. The caller must run the victim's eviction hook.
    #[must_use]
    pub fn put_if_absent(
        &self,
        run_id: &str,
        context: Arc<WorkflowExecutionContext>,
    ) -> (
        Arc<WorkflowExecutionContext>,
        Option<Arc<WorkflowExecutionContext>>,
    ) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.access_counter += 1;
        let counter = inner.access_counter;

        if let Some(existing) = inner.entries.get_mut(run_id) {
            existing.last_access = counter;
            return (existing.context.clone(), None);
        }

        let mut evicted = None;
        if inner.entries.len() >= self.capacity {
            if let Some(victim_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            {
                debug!(run_id = %victim_key, "Evicting workflow context from sticky cache");
                evicted = inner
                    .entries
                    .remove(&victim_key)
                    .map(|entry| entry.context);
            }
        }

        inner.entries.insert(
            run_id.to_string(),
            CacheEntry {
                context: context.clone(),
                last_access: counter,
            },
        );
        (context, evicted)
    }

    /// Remove an entry. The caller owns the destroy step; see
    /// [`WorkflowCache::evict`] for the hook-running variant.
    pub fn remove(&self, run_id: &str) -> Option<Arc<WorkflowExecutionContext>> {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.entries.remove(run_id).map(|entry| entry.context)
    }

    /// Remove an entry and run its eviction hook.
    pub async fn evict(&self, run_id: &str) {
        if let Some(context) = self.remove(run_id) {
            context.on_eviction().await;
        }
    }

    pub fn contains(&self, run_id: &str) -> bool {
        let inner = self.inner.lock().expect("cache lock");
        inner.entries.contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("cache lock");
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
