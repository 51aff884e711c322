//! # Unspent Output Cache
//!
//! Bounded in-memory map from out-point to a recently confirmed, unspent
//! output. The cache short-circuits the common validation path — a block
//! spending outputs confirmed a few blocks earlier — without touching the
//! mapped store.
//!
//! Contents are strictly confirmed-and-unspent: spent outputs are evicted
//! on `remove`, unconfirmed and indexed states never enter (they must be
//! resolved against the persistent store), and genesis outputs are never
//! cached because the genesis coinbase is never spendable.
//!
//! Eviction is lazy LRU: each hit re-stamps the entry and pushes a fresh
//! queue marker; eviction pops markers and drops entries whose stamp still
//! matches. The size bound is best-effort and may transiently exceed the
//! capacity by O(1).

use std::collections::VecDeque;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::chain::{OutPoint, Transaction};

#[derive(Debug, Clone)]
pub struct CachedOutput {
    pub value: u64,
    pub script: Vec<u8>,
    pub height: u32,
    pub coinbase: bool,
}

struct CacheEntry {
    output: CachedOutput,
    stamp: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<OutPoint, CacheEntry>,
    queue: VecDeque<(OutPoint, u64)>,
    clock: u64,
}

pub struct UtxoCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl UtxoCache {
    /// A capacity of zero disables the cache entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached view of `point` if it is usable at `fork_height`.
    /// A hit is always confirmed and unspent.
    pub fn populate(&self, point: &OutPoint, fork_height: u32) -> Option<CachedOutput> {
        if self.capacity == 0 {
            return None;
        }
        let mut inner = self.inner.lock();
        let CacheInner { entries, queue, clock } = &mut *inner;
        let entry = entries.get_mut(point)?;

        // Confirmed above the fork point: the store must decide.
        if entry.output.height > fork_height {
            return None;
        }

        *clock += 1;
        entry.stamp = *clock;
        let output = entry.output.clone();
        queue.push_back((*point, *clock));
        Some(output)
    }

    /// Inserts every output of a newly confirmed transaction. Unconfirmed
    /// stores and the genesis block are skipped.
    pub fn add(&self, tx: &Transaction, height: u32, confirming: bool) {
        if self.capacity == 0 || !confirming || height == 0 {
            return;
        }
        let hash = tx.hash();
        let coinbase = tx.is_coinbase();

        let mut inner = self.inner.lock();
        inner.clock += 1;
        let stamp = inner.clock;
        for (index, output) in tx.outputs.iter().enumerate() {
            let point = OutPoint::new(hash, index as u32);
            inner.entries.insert(
                point,
                CacheEntry {
                    output: CachedOutput {
                        value: output.value,
                        script: output.script.clone(),
                        height,
                        coinbase,
                    },
                    stamp,
                },
            );
            inner.queue.push_back((point, stamp));
        }
        Self::evict(&mut inner, self.capacity);
    }

    /// Evicts `point` after it was spent.
    pub fn remove(&self, point: &OutPoint) {
        if self.capacity == 0 {
            return;
        }
        self.inner.lock().entries.remove(point);
    }

    fn evict(inner: &mut CacheInner, capacity: usize) {
        while inner.entries.len() > capacity {
            let Some((point, stamp)) = inner.queue.pop_front() else {
                return;
            };
            // Stale markers (entry was touched or replaced since) are
            // skipped; the live marker is further back in the queue.
            if inner
                .entries
                .get(&point)
                .is_some_and(|entry| entry.stamp == stamp)
            {
                inner.entries.remove(&point);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Input, Output};

    fn transaction(seed: u8, outputs: usize) -> Transaction {
        Transaction {
            version: 1,
            locktime: 0,
            inputs: vec![Input {
                previous_output: OutPoint::new([seed; 32], 0),
                script: vec![seed],
                sequence: 0,
            }],
            outputs: (0..outputs)
                .map(|i| Output {
                    value: 100 + i as u64,
                    script: vec![seed, i as u8],
                })
                .collect(),
        }
    }

    #[test]
    fn confirmed_outputs_are_cached() {
        let cache = UtxoCache::new(16);
        let tx = transaction(1, 2);
        cache.add(&tx, 5, true);

        let hit = cache.populate(&OutPoint::new(tx.hash(), 1), u32::MAX).unwrap();
        assert_eq!(hit.value, 101);
        assert_eq!(hit.height, 5);
    }

    #[test]
    fn unconfirmed_and_genesis_are_skipped() {
        let cache = UtxoCache::new(16);
        let tx = transaction(1, 1);
        cache.add(&tx, 7, false);
        cache.add(&tx, 0, true);
        assert!(cache.is_empty());
    }

    #[test]
    fn entries_above_fork_height_miss() {
        let cache = UtxoCache::new(16);
        let tx = transaction(1, 1);
        cache.add(&tx, 10, true);

        let point = OutPoint::new(tx.hash(), 0);
        assert!(cache.populate(&point, 9).is_none());
        assert!(cache.populate(&point, 10).is_some());
    }

    #[test]
    fn removed_points_miss() {
        let cache = UtxoCache::new(16);
        let tx = transaction(1, 1);
        cache.add(&tx, 3, true);

        let point = OutPoint::new(tx.hash(), 0);
        cache.remove(&point);
        assert!(cache.populate(&point, u32::MAX).is_none());
    }

    #[test]
    fn eviction_prefers_untouched_entries() {
        let cache = UtxoCache::new(4);
        let first = transaction(1, 1);
        cache.add(&first, 1, true);
        let kept = OutPoint::new(first.hash(), 0);

        for seed in 2..=4 {
            cache.add(&transaction(seed, 1), seed as u32, true);
        }
        // Touch the oldest so eviction passes over it.
        assert!(cache.populate(&kept, u32::MAX).is_some());

        cache.add(&transaction(5, 1), 5, true);
        assert!(cache.populate(&kept, u32::MAX).is_some(), "touched entry evicted");
        assert!(cache.len() <= 5);
    }

    #[test]
    fn zero_capacity_disables_cache() {
        let cache = UtxoCache::new(0);
        let tx = transaction(1, 1);
        cache.add(&tx, 1, true);
        assert!(cache.populate(&OutPoint::new(tx.hash(), 0), u32::MAX).is_none());
    }
}
