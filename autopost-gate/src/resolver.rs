use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::api::{FlagError, StoreError};
use crate::config::{Config, MissingFlagPolicy};
use crate::flags::{FlagKey, FlagRecord};
use crate::flags_cache::{CacheLookup, FlagBatch, FlagsCache};
use crate::metrics_consts::{
    BATCH_FETCH_COUNTER, CACHE_HITS_COUNTER, CACHE_MISSES_COUNTER, MISSING_FLAG_COUNTER,
    SINGLE_FETCH_COUNTER,
};
use crate::store::Client;

/// Where a resolved record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// Served from the cache, including keys the cache already knows the store lacks.
    Cache,
    /// Fetched from the store during this call, or by a refresh this call joined.
    Remote,
    /// Synthesized by the missing flag policy after the store was asked.
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub record: FlagRecord,
    pub source: ResolutionSource,
}

/// Resolves flag keys to records, going through the in-memory cache first.
///
/// A cache miss on one of the known keys triggers one batch fetch for all of them.
/// Concurrent misses share that fetch through the cache's `get_or_refresh`. The fetch
/// runs as its own task and stores its batch on completion, so a caller that gives up
/// doesn't stop it from populating the cache for everyone else. Keys outside the known
/// set are fetched one at a time and never replace the batch.
pub struct FlagResolver {
    client: Arc<dyn Client + Send + Sync>,
    cache: Arc<FlagsCache>,
    policy: MissingFlagPolicy,
    known_keys: Arc<[FlagKey]>,
    fetch_timeout: Duration,
}

impl FlagResolver {
    pub fn new(
        client: Arc<dyn Client + Send + Sync>,
        cache: Arc<FlagsCache>,
        policy: MissingFlagPolicy,
        destinations: &[String],
        fetch_timeout: Duration,
    ) -> Self {
        let mut known_keys = vec![FlagKey::kill_switch(), FlagKey::autopost_enable()];
        for destination in destinations {
            let key = FlagKey::for_destination(destination);
            if !known_keys.contains(&key) {
                known_keys.push(key);
            }
        }

        FlagResolver {
            client,
            cache,
            policy,
            known_keys: known_keys.into(),
            fetch_timeout,
        }
    }

    pub fn from_config(config: &Config, client: Arc<dyn Client + Send + Sync>) -> Self {
        FlagResolver::new(
            client,
            Arc::new(FlagsCache::new(config.flags_cache_ttl())),
            config.missing_flag_policy,
            &config.destinations.0,
            config.flag_store_timeout(),
        )
    }

    pub fn cache(&self) -> &Arc<FlagsCache> {
        &self.cache
    }

    pub fn known_keys(&self) -> &[FlagKey] {
        &self.known_keys
    }

    pub async fn get(&self, key: &FlagKey) -> Result<FlagRecord, FlagError> {
        self.resolve(key).await.map(|resolution| resolution.record)
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn resolve(&self, key: &FlagKey) -> Result<Resolution, FlagError> {
        match self.cache.lookup(key).await {
            CacheLookup::Hit(record) => {
                metrics::counter!(CACHE_HITS_COUNTER).increment(1);
                return Ok(Resolution {
                    record,
                    source: ResolutionSource::Cache,
                });
            }
            CacheLookup::Absent => {
                metrics::counter!(CACHE_HITS_COUNTER).increment(1);
                return self.missing(key, ResolutionSource::Cache);
            }
            CacheLookup::Miss => {
                metrics::counter!(CACHE_MISSES_COUNTER).increment(1);
            }
        }

        if self.known_keys.contains(key) {
            match self.refresh(self.cache.generation()).await {
                Ok(batch) => match batch.lookup(key) {
                    CacheLookup::Hit(record) => {
                        return Ok(Resolution {
                            record,
                            source: ResolutionSource::Remote,
                        })
                    }
                    CacheLookup::Absent => return self.missing(key, ResolutionSource::Missing),
                    CacheLookup::Miss => {}
                },
                Err(e) => {
                    tracing::warn!("batch flag fetch failed, falling back to {}: {}", key, e);
                }
            }
        }

        self.fetch_single(key).await
    }

    /// Fetches every known key in one batch, or joins the fetch already running.
    async fn refresh(&self, generation: u64) -> Result<Arc<FlagBatch>, Arc<StoreError>> {
        let client = self.client.clone();
        let cache = self.cache.clone();
        let keys = self.known_keys.clone();
        let fetch_timeout = self.fetch_timeout;

        let task = async move {
            let flags = match tokio::time::timeout(fetch_timeout, client.fetch_flags(&keys)).await
            {
                Ok(Ok(flags)) => flags,
                Ok(Err(e)) => {
                    metrics::counter!(BATCH_FETCH_COUNTER, "result" => "error").increment(1);
                    return Err(e);
                }
                Err(_) => {
                    metrics::counter!(BATCH_FETCH_COUNTER, "result" => "timeout").increment(1);
                    return Err(StoreError::Timeout);
                }
            };
            metrics::counter!(BATCH_FETCH_COUNTER, "result" => "ok").increment(1);

            let records = flags.into_iter().map(FlagRecord::from).collect();
            let batch = Arc::new(FlagBatch::new(&keys, records));
            cache.put_batch(generation, batch.clone()).await;
            Ok(batch)
        };

        self.cache
            .get_or_refresh(generation, async move {
                tokio::spawn(task).await.unwrap_or_else(|e| {
                    Err(StoreError::Unavailable(format!(
                        "flag refresh task failed: {}",
                        e
                    )))
                })
            })
            .await
    }

    async fn fetch_single(&self, key: &FlagKey) -> Result<Resolution, FlagError> {
        let generation = self.cache.generation();
        let result = tokio::time::timeout(self.fetch_timeout, self.client.fetch_flag(key))
            .await
            .unwrap_or(Err(StoreError::Timeout));

        match result {
            Ok(flag) => {
                metrics::counter!(SINGLE_FETCH_COUNTER, "result" => "ok").increment(1);
                let record = FlagRecord::from(flag);
                self.cache
                    .insert(generation, key.clone(), Some(record.clone()))
                    .await;
                Ok(Resolution {
                    record,
                    source: ResolutionSource::Remote,
                })
            }
            Err(e) if e.store_answered() => {
                metrics::counter!(SINGLE_FETCH_COUNTER, "result" => "not_found").increment(1);
                tracing::debug!("flag store has no usable record for {}: {}", key, e);
                self.cache.insert(generation, key.clone(), None).await;
                self.missing(key, ResolutionSource::Missing)
            }
            Err(e) => {
                metrics::counter!(SINGLE_FETCH_COUNTER, "result" => "error").increment(1);
                tracing::warn!("failed to fetch {} from the flag store: {}", key, e);
                Err(FlagError::RemoteStoreUnavailable(e.to_string()))
            }
        }
    }

    /// Applies the missing flag policy. Absences already known to the cache were
    /// reported when they were first seen, so they stay quiet.
    fn missing(&self, key: &FlagKey, source: ResolutionSource) -> Result<Resolution, FlagError> {
        let fresh = source != ResolutionSource::Cache;
        if fresh {
            metrics::counter!(MISSING_FLAG_COUNTER, "policy" => self.policy.as_str())
                .increment(1);
        }

        match self.policy.synthetic_value() {
            Some(enabled) => {
                if fresh {
                    tracing::warn!(
                        key = %key,
                        policy = self.policy.as_str(),
                        "flag missing from the flag store, using synthetic record"
                    );
                }
                Ok(Resolution {
                    record: FlagRecord::synthetic(key.clone(), enabled),
                    source,
                })
            }
            None => {
                if fresh {
                    tracing::error!(key = %key, "flag missing from the flag store");
                }
                Err(FlagError::MissingFlag(key.clone()))
            }
        }
    }

    /// Clears the cache. Fetches still in flight land under the old generation and are
    /// never served.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }
}
