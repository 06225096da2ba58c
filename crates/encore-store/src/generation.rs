use crate::arena::{Arena, Node};
use crate::entry::{CachedEntry, StoreError, StoreStats};
use crate::key::RequestKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One named, versioned store generation.
///
/// Entries are kept in insertion order. `put` on an existing key replaces the
/// entry and moves it to the newest position. All methods take `&self`; a
/// single `RwLock` guards the map and arena, and every call acquires and
/// releases it on its own. Callers composing several calls get no atomicity
/// across them; `put_evicting` covers the evict-then-insert case.
pub struct Generation {
    name: String,
    quota: Option<usize>,
    inner: RwLock<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct Inner {
    arena: Arena,
    map: HashMap<RequestKey, u32>,
    bytes: usize,
}

impl Inner {
    fn weight_of(&self, key: &RequestKey) -> usize {
        self.map
            .get(key)
            .and_then(|&index| self.arena.get(index))
            .map(|node| node.value.weight())
            .unwrap_or(0)
    }

    fn remove(&mut self, key: &RequestKey) -> Option<Node> {
        let index = self.map.remove(key)?;
        let node = self.arena.remove(index)?;
        self.bytes -= node.value.weight();
        Some(node)
    }

    fn insert(&mut self, key: RequestKey, value: CachedEntry) {
        self.remove(&key);
        self.bytes += value.weight();
        let index = self.arena.push_head(Node::new(key.clone(), value));
        self.map.insert(key, index);
    }
}

impl Generation {
    pub fn new(name: impl Into<String>, quota: Option<usize>) -> Self {
        Self {
            name: name.into(),
            quota,
            inner: RwLock::new(Inner {
                arena: Arena::new(),
                map: HashMap::new(),
                bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an entry, counting a hit or miss.
    pub fn get(&self, key: &RequestKey) -> Option<Arc<CachedEntry>> {
        let inner = self.inner.read();
        let found = inner
            .map
            .get(key)
            .and_then(|&index| inner.arena.get(index))
            .map(|node| Arc::clone(&node.value));

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Presence check that does not touch the hit/miss counters.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.inner.read().map.contains_key(key)
    }

    /// Insert or replace one entry. Fails without modifying the generation if
    /// the quota would be exceeded.
    pub fn put(&self, key: RequestKey, value: CachedEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let replaced = inner.weight_of(&key);
        self.check_quota(inner.bytes - replaced, value.weight())?;
        inner.insert(key, value);
        Ok(())
    }

    /// Insert a batch atomically: either every entry is stored or none is.
    pub fn put_all(&self, entries: Vec<(RequestKey, CachedEntry)>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        // Later duplicates in the batch win, matching sequential puts.
        let mut batch: HashMap<&RequestKey, usize> = HashMap::new();
        for (key, value) in &entries {
            batch.insert(key, value.weight());
        }
        let replaced: usize = batch.keys().map(|key| inner.weight_of(key)).sum();
        let incoming: usize = batch.values().sum();
        self.check_quota(inner.bytes - replaced, incoming)?;

        for (key, value) in entries {
            inner.insert(key, value);
        }
        Ok(())
    }

    /// Remove `victims` and insert `value` under `key` as one step. The quota
    /// check credits the bytes the victims free; a refused insert leaves every
    /// victim in place. Returns the victims that were present and removed,
    /// counted as evictions.
    pub fn put_evicting(
        &self,
        key: RequestKey,
        value: CachedEntry,
        victims: &[RequestKey],
    ) -> Result<Vec<RequestKey>, StoreError> {
        let mut inner = self.inner.write();

        let present: Vec<&RequestKey> = victims
            .iter()
            .filter(|victim| **victim != key && inner.map.contains_key(*victim))
            .collect();
        let freed: usize = present.iter().map(|victim| inner.weight_of(victim)).sum();
        let replaced = inner.weight_of(&key);
        self.check_quota(inner.bytes - freed - replaced, value.weight())?;

        let mut evicted = Vec::with_capacity(present.len());
        for victim in present {
            if inner.remove(victim).is_some() {
                evicted.push(victim.clone());
            }
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        inner.insert(key, value);
        Ok(evicted)
    }

    fn check_quota(&self, retained: usize, needed: usize) -> Result<(), StoreError> {
        if let Some(quota) = self.quota {
            let available = quota.saturating_sub(retained);
            if needed > available {
                return Err(StoreError::QuotaExceeded {
                    needed,
                    available,
                    quota,
                });
            }
        }
        Ok(())
    }

    /// All keys, oldest first.
    pub fn keys(&self) -> Vec<RequestKey> {
        self.keys_matching(|_| true)
    }

    /// Keys accepted by `pred`, oldest first.
    pub fn keys_matching<F>(&self, pred: F) -> Vec<RequestKey>
    where
        F: Fn(&RequestKey) -> bool,
    {
        self.inner
            .read()
            .arena
            .iter_oldest_first()
            .filter(|node| pred(&node.key))
            .map(|node| node.key.clone())
            .collect()
    }

    pub fn count_matching<F>(&self, pred: F) -> usize
    where
        F: Fn(&RequestKey) -> bool,
    {
        self.inner
            .read()
            .arena
            .iter_oldest_first()
            .filter(|node| pred(&node.key))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged against the quota.
    pub fn bytes(&self) -> usize {
        self.inner.read().bytes
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: inner.arena.len(),
            bytes: inner.bytes,
        }
    }
}
