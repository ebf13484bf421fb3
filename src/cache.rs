//! Bounded response cache.
//!
//! Eviction is strictly by insertion order: once full, the oldest-inserted
//! entry goes first, regardless of how recently it was read.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::config::DEFAULT_CACHE_CAPACITY;
use crate::orchestrator::{GenerationOptions, GenerationResponse};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, GenerationResponse>,
    order: VecDeque<String>,
}

pub struct ResponseCache {
    inner: Mutex<Entries>,
    capacity: usize,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Entries::default()),
            capacity: capacity.max(1),
        }
    }

    /// Composite fingerprint of a request. Options are serialized through a
    /// sorted map, so construction order never changes the key.
    pub fn key(url: &str, provider: &str, options: Option<&GenerationOptions>) -> String {
        let mut canonical: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        if let Some(opts) = options {
            if let Some(t) = opts.temperature {
                canonical.insert("temperature", serde_json::json!(t));
            }
            if let Some(m) = opts.max_tokens {
                canonical.insert("maxTokens", serde_json::json!(m));
            }
        }
        let options_json = serde_json::to_string(&canonical).unwrap_or_else(|_| "{}".to_string());
        format!("{url}::{provider}::{options_json}")
    }

    // A poisoned lock only means another thread panicked mid-operation;
    // every operation below leaves the entries consistent, so keep going.
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<GenerationResponse> {
        self.lock().map.get(key).cloned()
    }

    pub fn put(&self, key: String, response: GenerationResponse) {
        let mut entries = self.lock();

        // Overwrite keeps the original insertion position.
        if let Some(slot) = entries.map.get_mut(&key) {
            *slot = response;
            return;
        }

        if entries.map.len() >= self.capacity
            && let Some(oldest) = entries.order.pop_front()
        {
            entries.map.remove(&oldest);
            tracing::debug!(key = %oldest, "cache evicted oldest entry");
        }

        entries.order.push_back(key.clone());
        entries.map.insert(key, response);
    }

    pub fn has(&self, key: &str) -> bool {
        self.lock().map.contains_key(key)
    }

    pub fn size(&self) -> usize {
        self.lock().map.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.map.clear();
        entries.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.size(),
            max_size: self.capacity,
        }
    }
}
