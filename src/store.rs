//  Copyright 2025 Greenroom Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{
    key::CacheKey,
    model::{ModelConfig, Weight},
    record::CacheRecord,
};

/// Keyed collection of cache records plus the recency list, guarded by one
/// mutex. Enforces the byte budget by evicting from the least recently used
/// end.
pub(crate) struct EntryStore<W: Weight, C: ModelConfig> {
    budget: AtomicU64,
    inner: Mutex<StoreInner<W, C>>,
}

struct StoreInner<W: Weight, C: ModelConfig> {
    records: HashMap<CacheKey, Arc<CacheRecord<W, C>>>,
    /// Most recently used at the tail. Every record's key appears exactly
    /// once.
    recency: VecDeque<CacheKey>,
    usage: u64,
}

impl<W: Weight, C: ModelConfig> StoreInner<W, C> {
    fn remove(&mut self, key: &CacheKey) -> Option<Arc<CacheRecord<W, C>>> {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        let record = self.records.remove(key)?;
        self.usage -= record.size_bytes();
        Some(record)
    }
}

impl<W: Weight, C: ModelConfig> EntryStore<W, C> {
    pub fn new(budget: u64) -> Self {
        Self {
            budget: AtomicU64::new(budget),
            inner: Mutex::new(StoreInner {
                records: HashMap::new(),
                recency: VecDeque::new(),
                usage: 0,
            }),
        }
    }

    pub fn byte_budget(&self) -> u64 {
        self.budget.load(Ordering::Relaxed)
    }

    pub fn set_byte_budget(&self, budget: u64) {
        self.budget.store(budget, Ordering::Relaxed);
    }

    /// Insert a record, evicting as needed. Idempotent: an already present
    /// key leaves the store unchanged. Returns the number of evictions
    /// performed.
    pub fn insert(&self, record: CacheRecord<W, C>) -> usize {
        let budget = self.byte_budget();
        let mut inner = self.inner.lock();
        if inner.records.contains_key(record.key()) {
            return 0;
        }
        let evicted = Self::make_room(&mut inner, budget, record.size_bytes());
        let key = record.key().clone();
        inner.usage += record.size_bytes();
        inner.records.insert(key.clone(), Arc::new(record));
        inner.recency.push_back(key);
        evicted
    }

    /// Move `key` to the most recently used position. A missing key is
    /// tolerated so callers racing with eviction need no coordination.
    pub fn touch(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.recency.iter().position(|k| k == key) {
            inner.recency.remove(pos);
            inner.recency.push_back(key.clone());
        }
    }

    /// Read-only lookup; does not touch recency.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheRecord<W, C>>> {
        self.inner.lock().records.get(key).cloned()
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CacheRecord<W, C>>> {
        self.inner.lock().remove(key)
    }

    pub fn current_bytes(&self) -> u64 {
        self.inner.lock().usage
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn records(&self) -> Vec<Arc<CacheRecord<W, C>>> {
        self.inner.lock().records.values().cloned().collect()
    }

    /// Evict least recently used records until `needed` bytes fit in the
    /// budget. Locked records are skipped; if only locked records remain the
    /// store is allowed to run over budget so callers keep making progress.
    fn make_room(inner: &mut StoreInner<W, C>, budget: u64, needed: u64) -> usize {
        if inner.usage + needed > budget {
            tracing::debug!(
                "budget exceeded: {} + {} > {} bytes, evicting",
                inner.usage,
                needed,
                budget
            );
        }

        let mut evicted = 0;
        let mut cursor = 0;
        while inner.usage + needed > budget && cursor < inner.recency.len() {
            let key = inner.recency[cursor].clone();
            let locked = inner
                .records
                .get(&key)
                .map_or(false, |record| record.active_locks() > 0);
            if locked {
                cursor += 1;
                continue;
            }
            if let Some(record) = inner.remove(&key) {
                evicted += 1;
                tracing::debug!("evicted {} ({} bytes)", key, record.size_bytes());
            }
        }

        if inner.usage + needed > budget {
            tracing::warn!(
                "cache budget over-committed: {} + {} > {} bytes and every remaining record is locked",
                inner.usage,
                needed,
                budget
            );
        }

        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{artifact, TestConfig, TestWeight};

    type TestStore = EntryStore<TestWeight, TestConfig>;

    fn record(key: &str, size: u64) -> CacheRecord<TestWeight, TestConfig> {
        CacheRecord::new(CacheKey::new(key, None), size, artifact(size))
    }

    fn keys(store: &TestStore) -> Vec<String> {
        let mut keys = store
            .records()
            .iter()
            .map(|r| r.key().as_str().to_string())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    #[test]
    fn test_lru_eviction_order() {
        let store = TestStore::new(100);
        store.insert(record("a", 40));
        store.insert(record("b", 40));
        let evicted = store.insert(record("c", 40));
        assert_eq!(evicted, 1);
        assert_eq!(keys(&store), ["b", "c"]);
        assert_eq!(store.current_bytes(), 80);
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let store = TestStore::new(100);
        store.insert(record("a", 40));
        store.insert(record("b", 40));
        store.touch(&CacheKey::new("a", None));
        store.insert(record("c", 40));
        assert_eq!(keys(&store), ["a", "c"]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let store = TestStore::new(100);
        store.insert(record("a", 40));
        store.insert(record("a", 70));
        assert_eq!(store.current_bytes(), 40);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_touch_of_missing_key_is_a_noop() {
        let store = TestStore::new(100);
        store.insert(record("a", 40));
        store.touch(&CacheKey::new("gone", None));
        assert_eq!(keys(&store), ["a"]);
    }

    #[test]
    fn test_locked_records_are_skipped() {
        let store = TestStore::new(100);
        store.insert(record("a", 40));
        store.insert(record("b", 40));
        store.lookup(&CacheKey::new("a", None)).unwrap().acquire_lock();
        store.insert(record("c", 40));
        assert_eq!(keys(&store), ["a", "c"]);
    }

    #[test]
    fn test_over_commit_when_everything_is_locked() {
        let store = TestStore::new(100);
        store.insert(record("a", 60));
        store.lookup(&CacheKey::new("a", None)).unwrap().acquire_lock();
        store.insert(record("b", 60));
        assert_eq!(keys(&store), ["a", "b"]);
        assert_eq!(store.current_bytes(), 120);
    }

    #[test]
    fn test_remove() {
        let store = TestStore::new(100);
        store.insert(record("a", 40));
        assert!(store.remove(&CacheKey::new("a", None)).is_some());
        assert!(store.remove(&CacheKey::new("a", None)).is_none());
        assert_eq!(store.current_bytes(), 0);
        assert_eq!(store.len(), 0);
    }
}
