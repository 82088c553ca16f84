//! Bounded TTL memo of prior provider results.
//!
//! Keys are `(category, prompt fingerprint, temperature)`. Expiry is lazy:
//! a stale entry is dropped when a read finds it. Capacity overflow evicts
//! the oldest-inserted entry (FIFO), not the least recently read.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::dispatch::Usage;
use crate::router::TaskCategory;

#[derive(Clone, Debug, PartialEq)]
pub struct CachedResponse {
    pub content: String,
    pub usage: Usage,
    pub provider: String,
}

#[derive(Debug)]
struct CacheEntry {
    result: CachedResponse,
    inserted_at: Instant,
    /// Distinguishes re-insertions of the same key in the FIFO order.
    generation: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<(String, u64)>,
    next_generation: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Cache key: category, sha256 prefix of system prompt + prompt, temperature.
    pub fn key(
        category: TaskCategory,
        system_prompt: Option<&str>,
        prompt: &str,
        temperature: f64,
    ) -> String {
        format!(
            "{}:{}:{temperature}",
            category.as_str(),
            fingerprint(system_prompt, prompt)
        )
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let expired = inner
            .entries
            .get(key)
            .map(|e| e.inserted_at.elapsed() >= self.ttl);
        let fresh = match expired {
            Some(false) => inner.entries.get(key).map(|e| e.result.clone()),
            Some(true) => {
                // Expired: drop the entry; its FIFO slot is skipped at eviction.
                inner.entries.remove(key);
                None
            }
            None => None,
        };

        match fresh {
            Some(result) => {
                inner.hits += 1;
                tracing::debug!(key, "cache hit");
                Some(result)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, key: String, result: CachedResponse) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.order.push_back((key.clone(), generation));
        inner.entries.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
                generation,
            },
        );

        while inner.entries.len() > self.capacity {
            let Some((oldest, generation)) = inner.order.pop_front() else {
                break;
            };
            // Skip FIFO slots superseded by a later insert or already expired.
            if inner
                .entries
                .get(&oldest)
                .is_some_and(|e| e.generation == generation)
            {
                inner.entries.remove(&oldest);
                tracing::debug!(key = oldest, "cache evicted oldest entry");
            }
        }

        // Keep the order queue from growing without bound on churned keys.
        if inner.order.len() > self.capacity * 4 {
            let CacheInner { entries, order, .. } = &mut *inner;
            order.retain(|(k, g)| entries.get(k).is_some_and(|e| e.generation == *g));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

/// First 16 hex chars of sha256(system prompt, NUL, prompt).
pub fn fingerprint(system_prompt: Option<&str>, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(system) = system_prompt {
        hasher.update(system.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
