//! Local cache of persisted documents, keyed by id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::tracker::Document;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub document: Document,
    /// When the entry was last written.
    pub at: DateTime<Utc>,
}

/// Mirrors documents as they are on the server.
///
/// A disabled cache never stores anything, so every lookup misses.
#[derive(Debug, Default)]
pub struct DocumentCache {
    enabled: bool,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl DocumentCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.entries().get(id).map(|entry| entry.document.clone())
    }

    pub fn entry(&self, id: &str) -> Option<CacheEntry> {
        self.entries().get(id).cloned()
    }

    pub fn insert(&self, id: &str, document: Document) {
        if !self.enabled {
            return;
        }
        self.entries().insert(
            id.to_string(),
            CacheEntry {
                document,
                at: Utc::now(),
            },
        );
    }

    /// Replaces an existing entry. Returns `false` when `id` is not cached.
    pub fn refresh(&self, id: &str, document: Document) -> bool {
        match self.entries().get_mut(id) {
            Some(entry) => {
                entry.document = document;
                entry.at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn evict(&self, id: &str) -> Option<Document> {
        self.entries().remove(id).map(|entry| entry.document)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
