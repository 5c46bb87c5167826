use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::api::StoreError;
use crate::flags::{FlagKey, FlagRecord};

// per-key answers for flags outside the batch, e.g. destinations nobody configured
const MAX_SINGLE_ENTRIES: u64 = 1_024;

/// Answer of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(FlagRecord),
    /// The store was asked for the key within the TTL and had no record of it.
    Absent,
    /// Nothing usable: the caller has to go to the store.
    Miss,
}

/// The answer to one batch request: the records found plus every key that was asked for.
#[derive(Debug, Default)]
pub struct FlagBatch {
    records: HashMap<FlagKey, FlagRecord>,
    requested: HashSet<FlagKey>,
}

impl FlagBatch {
    pub fn new(requested: &[FlagKey], records: Vec<FlagRecord>) -> Self {
        FlagBatch {
            records: records.into_iter().map(|r| (r.key.clone(), r)).collect(),
            requested: requested.iter().cloned().collect(),
        }
    }

    pub fn lookup(&self, key: &FlagKey) -> CacheLookup {
        match self.records.get(key) {
            Some(record) => CacheLookup::Hit(record.clone()),
            None if self.requested.contains(key) => CacheLookup::Absent,
            None => CacheLookup::Miss,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Per-process flag cache refreshed in whole batches.
///
/// The batch lives in a moka cache under a single entry, so a refresh swaps it
/// atomically and `try_get_with` coalesces concurrent refreshes into one fetch.
/// Entries are keyed by a generation that `invalidate` bumps: moka doesn't cancel an
/// initialization that is already running when `invalidate_all` is called, and its
/// result would otherwise land as a valid entry. Under the generation key it lands
/// where nobody reads and ages out with the TTL.
pub struct FlagsCache {
    batches: Cache<u64, Arc<FlagBatch>>,
    singles: Cache<(u64, FlagKey), Option<FlagRecord>>,
    generation: AtomicU64,
}

impl FlagsCache {
    pub fn new(ttl: Duration) -> Self {
        FlagsCache {
            batches: Cache::builder().time_to_live(ttl).build(),
            singles: Cache::builder()
                .max_capacity(MAX_SINGLE_ENTRIES)
                .time_to_live(ttl)
                .build(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns the record for `key` if one is cached within the TTL.
    pub async fn get(&self, key: &FlagKey) -> Option<FlagRecord> {
        match self.lookup(key).await {
            CacheLookup::Hit(record) => Some(record),
            CacheLookup::Absent | CacheLookup::Miss => None,
        }
    }

    pub async fn lookup(&self, key: &FlagKey) -> CacheLookup {
        let generation = self.generation();
        if let Some(batch) = self.batches.get(&generation).await {
            match batch.lookup(key) {
                CacheLookup::Miss => {}
                found => return found,
            }
        }

        match self.singles.get(&(generation, key.clone())).await {
            Some(Some(record)) => CacheLookup::Hit(record),
            Some(None) => CacheLookup::Absent,
            None => CacheLookup::Miss,
        }
    }

    /// True when no full refresh happened within the TTL.
    pub fn is_stale(&self) -> bool {
        !self.batches.contains_key(&self.generation())
    }

    /// Replaces the cache contents with a freshly fetched batch of records.
    pub async fn put(&self, records: Vec<FlagRecord>) {
        let requested: Vec<FlagKey> = records.iter().map(|r| r.key.clone()).collect();
        self.put_batch(self.generation(), Arc::new(FlagBatch::new(&requested, records)))
            .await;
    }

    pub async fn put_batch(&self, generation: u64, batch: Arc<FlagBatch>) {
        self.batches.insert(generation, batch).await;
    }

    /// Returns the batch cached for `generation`, running `init` to fetch it otherwise.
    /// Concurrent callers for the same generation share a single `init`.
    pub async fn get_or_refresh<F>(
        &self,
        generation: u64,
        init: F,
    ) -> Result<Arc<FlagBatch>, Arc<StoreError>>
    where
        F: Future<Output = Result<Arc<FlagBatch>, StoreError>>,
    {
        self.batches.try_get_with(generation, init).await
    }

    /// Caches the per-key answer for a flag fetched outside a batch. `None` records that
    /// the store has no such flag. Doesn't count as a full refresh.
    pub async fn insert(&self, generation: u64, key: FlagKey, record: Option<FlagRecord>) {
        self.singles.insert((generation, key), record).await;
    }

    /// Drops everything and forces the next lookup to go to the store.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.batches.invalidate_all();
        self.singles.invalidate_all();
    }

    /// Records that are still within the TTL, sorted by key.
    pub async fn records(&self) -> Vec<FlagRecord> {
        let generation = self.generation();
        let mut records = BTreeMap::new();

        for (key, record) in self.singles.iter() {
            if key.0 != generation {
                continue;
            }
            if let Some(record) = record {
                records.insert(record.key.clone(), record);
            }
        }
        if let Some(batch) = self.batches.get(&generation).await {
            for record in batch.records.values() {
                records.insert(record.key.clone(), record.clone());
            }
        }

        records.into_values().collect()
    }
}
