//! In-memory browsing history. Newest first, bounded, lost on restart.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::DEFAULT_HISTORY_CAPACITY;

pub struct History {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a visit. Revisiting a URL moves it to the front.
    pub fn record(&self, url: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|u| u != url);
        entries.push_front(url.to_string());
        entries.truncate(self.capacity);
    }

    /// Up to `limit` most recent URLs (all of them when `None`).
    pub fn recent(&self, limit: Option<usize>) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let n = limit.unwrap_or(entries.len());
        entries.iter().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
