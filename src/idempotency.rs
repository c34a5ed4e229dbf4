//! TTL-bounded cache of idempotency-key → cached control-op outcome (spec
//! §4.7). Expiry is lazy, checked on `get`, matching the spec's documented
//! ambiguity resolution (§9 ambiguity 2): 5 minutes, lazy eviction.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::OrchestratorError;

#[derive(Clone)]
struct Entry {
    outcome: Result<(), String>,
    created_at: Instant,
}

pub struct IdempotencyCache {
    ttl: Duration,
    entries: DashMap<String, Entry>,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        IdempotencyCache {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Returns the cached outcome if `key` was set within the TTL window.
    /// A lookup that finds an expired entry removes it.
    pub fn get(&self, key: &str) -> Option<Result<(), OrchestratorError>> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.created_at.elapsed() > self.ttl,
            None => return None,
        };

        if expired {
            self.entries.remove(key);
            return None;
        }

        self.entries
            .get(key)
            .map(|entry| entry.outcome.clone().map_err(OrchestratorError::Other))
    }

    pub fn set(&self, key: String, outcome: Result<(), String>) {
        self.entries.insert(
            key,
            Entry {
                outcome,
                created_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
