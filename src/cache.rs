use dashmap::DashMap;

use crate::step::StepRunResult;

/// Injectable step-result cache. The runner only needs a key/value map;
/// persistence, eviction and sharing across jobs are the store's business.
///
/// Concurrent access follows last-writer-wins: two steps missing on the
/// same key at the same time may both execute and both write.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<StepRunResult>;
    fn put(&self, key: &str, value: StepRunResult);
}

/// Default in-memory store. No eviction; entries live as long as the store.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, StepRunResult>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for InMemoryCache {
    fn get(&self, key: &str) -> Option<StepRunResult> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    fn put(&self, key: &str, value: StepRunResult) {
        self.entries.insert(key.to_string(), value);
    }
}
