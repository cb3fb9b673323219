//! Cache of derived computations, invalidated by event arrival.
//!
//! Every key declares the aggregate types its value was derived from. The
//! invalidation task ([`spawn_invalidator`]) drops a key as soon as an event of
//! one of those types is published. TTL and time-to-idle expiry apply on top.
//!
//! ## Stale values
//!
//! A value computed while an invalidation of one of its dependencies happens
//! is returned to its caller but not stored. Each dependency has a generation
//! counter; the insert only happens if the generations read before computing
//! are unchanged, checked under a gate that invalidations hold exclusively.

mod invalidation;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

pub use invalidation::spawn_invalidator;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("computing {key} failed: {reason}")]
    Compute { key: String, reason: String },
}

/// Server-constructed cache key with its dependency set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    depends_on: BTreeSet<String>,
}

impl CacheKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Invalidate this key whenever an event of `aggregate_type` is published.
    pub fn depends_on(mut self, aggregate_type: impl Into<String>) -> Self {
        self.depends_on.insert(aggregate_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Used when `get_or_compute` is called without a TTL.
    pub default_ttl: Duration,
    /// Entries not read for this long expire; `None` disables idle expiry.
    pub time_to_idle: Option<Duration>,
    /// How often the invalidation task sweeps expired entries.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            time_to_idle: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    depends_on: BTreeSet<String>,
    expires_at: Instant,
    last_access: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant, time_to_idle: Option<Duration>) -> bool {
        now >= self.expires_at
            || time_to_idle.is_some_and(|idle| now.duration_since(self.last_access) >= idle)
    }
}

/// Generations observed before a computation started.
#[derive(Debug, PartialEq, Eq)]
struct Stamp {
    global: u64,
    per_type: Vec<u64>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

/// Concurrent cache; share it behind an `Arc`.
#[derive(Debug)]
pub struct InvalidatingCache<V> {
    entries: DashMap<String, Entry<V>>,
    generations: DashMap<String, u64>,
    global_generation: AtomicU64,
    gate: RwLock<()>,
    config: CacheConfig,
    counters: Counters,
}

impl<V> InvalidatingCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            global_generation: AtomicU64::new(0),
            gate: RwLock::new(()),
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached value for `key`, computing (and caching) it on a miss.
    ///
    /// Concurrent misses for the same key may compute more than once; the last
    /// valid result wins.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: std::fmt::Display,
    {
        if let Some(value) = self.lookup(key.name()) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let stamp = self.stamp(&key.depends_on);
        let value = compute().await.map_err(|e| CacheError::Compute {
            key: key.name().to_string(),
            reason: e.to_string(),
        })?;

        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.stamp(&key.depends_on) == stamp {
            let now = Instant::now();
            self.entries.insert(
                key.name().to_string(),
                Entry {
                    value: value.clone(),
                    depends_on: key.depends_on.clone(),
                    expires_at: now + ttl.unwrap_or(self.config.default_ttl),
                    last_access: now,
                },
            );
        } else {
            debug!(key = key.name(), "dependency invalidated during compute; not caching");
        }
        Ok(value)
    }

    fn lookup(&self, name: &str) -> Option<V> {
        let now = Instant::now();
        let mut entry = self.entries.get_mut(name)?;
        if entry.is_expired(now, self.config.time_to_idle) {
            drop(entry);
            if self
                .entries
                .remove_if(name, |_, entry| entry.is_expired(now, self.config.time_to_idle))
                .is_some()
            {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }
        entry.last_access = now;
        Some(entry.value.clone())
    }

    fn stamp(&self, depends_on: &BTreeSet<String>) -> Stamp {
        Stamp {
            global: self.global_generation.load(Ordering::Acquire),
            per_type: depends_on
                .iter()
                .map(|t| self.generations.get(t).map(|g| *g).unwrap_or(0))
                .collect(),
        }
    }

    /// Drop every entry depending on `aggregate_type`.
    pub fn invalidate_aggregate_type(&self, aggregate_type: &str) -> usize {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        *self.generations.entry(aggregate_type.to_string()).or_insert(0) += 1;
        self.remove_matching(|entry| entry.depends_on.contains(aggregate_type))
    }

    /// Drop every entry whose key name satisfies `predicate`.
    pub fn invalidate_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        // The predicate is opaque, so in-flight computations of any key are suspect.
        self.global_generation.fetch_add(1, Ordering::AcqRel);
        let before = self.entries.len();
        self.entries.retain(|name, _| !predicate(name));
        self.count_invalidations(before.saturating_sub(self.entries.len()))
    }

    pub fn invalidate_all(&self) -> usize {
        self.invalidate_where(|_| true)
    }

    fn remove_matching(&self, matches: impl Fn(&Entry<V>) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !matches(entry));
        self.count_invalidations(before.saturating_sub(self.entries.len()))
    }

    fn count_invalidations(&self, removed: usize) -> usize {
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove entries past their TTL or idle time.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.time_to_idle;
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now, idle));
        let evicted = before.saturating_sub(self.entries.len());
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;

    use tokio::sync::Notify;

    use super::*;

    fn cache() -> InvalidatingCache<u64> {
        InvalidatingCache::new(CacheConfig {
            default_ttl: Duration::from_secs(60),
            time_to_idle: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(5),
        })
    }

    async fn get(cache: &InvalidatingCache<u64>, key: &CacheKey, value: u64) -> u64 {
        cache
            .get_or_compute(key, None, || async move { Ok::<_, Infallible>(value) })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn second_lookup_is_a_hit() {
        let cache = cache();
        let key = CacheKey::new("stats:counter").depends_on("counter");
        assert_eq!(get(&cache, &key, 1).await, 1);
        assert_eq!(get(&cache, &key, 2).await, 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                ..CacheStats::default()
            }
        );
    }

    #[tokio::test]
    async fn invalidation_only_hits_dependents() {
        let cache = cache();
        let counters = CacheKey::new("stats:counter").depends_on("counter");
        let both = CacheKey::new("summary").depends_on("counter").depends_on("task");
        let tasks = CacheKey::new("stats:task").depends_on("task");
        get(&cache, &counters, 1).await;
        get(&cache, &both, 1).await;
        get(&cache, &tasks, 1).await;

        assert_eq!(cache.invalidate_aggregate_type("counter"), 2);
        assert_eq!(get(&cache, &counters, 2).await, 2);
        assert_eq!(get(&cache, &both, 2).await, 2);
        assert_eq!(get(&cache, &tasks, 2).await, 1);
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[tokio::test]
    async fn invalidate_where_matches_key_names() {
        let cache = cache();
        get(&cache, &CacheKey::new("stats:counter"), 1).await;
        get(&cache, &CacheKey::new("stats:task"), 1).await;
        get(&cache, &CacheKey::new("other"), 1).await;

        assert_eq!(cache.invalidate_where(|name| name.starts_with("stats:")), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_and_idle_expiry() {
        let cache = cache();
        let key = CacheKey::new("k");

        cache
            .get_or_compute(&key, Some(Duration::from_secs(10)), || async {
                Ok::<_, Infallible>(1)
            })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(get(&cache, &key, 2).await, 2);

        // Read every 20s: stays alive past the idle window until the TTL.
        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(20)).await;
            assert_eq!(get(&cache, &key, 3).await, 2);
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test]
    async fn value_computed_across_an_invalidation_is_not_stored() {
        let cache = Arc::new(cache());
        let key = CacheKey::new("stats:counter").depends_on("counter");
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let computing = {
            let (cache, key) = (Arc::clone(&cache), key.clone());
            let (started, release) = (Arc::clone(&started), Arc::clone(&release));
            tokio::spawn(async move {
                cache
                    .get_or_compute(&key, None, || async move {
                        started.notify_one();
                        release.notified().await;
                        Ok::<_, Infallible>(1)
                    })
                    .await
            })
        };

        started.notified().await;
        cache.invalidate_aggregate_type("counter");
        release.notify_one();

        assert_eq!(computing.await.unwrap().unwrap(), 1);
        assert!(cache.is_empty());
        assert_eq!(get(&cache, &key, 2).await, 2);
    }

    #[tokio::test]
    async fn compute_errors_are_not_cached() {
        let cache = cache();
        let key = CacheKey::new("k");
        let err = cache
            .get_or_compute(&key, None, || async { Err::<u64, _>("store down") })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::Compute {
                key: "k".to_string(),
                reason: "store down".to_string(),
            }
        );
        assert!(cache.is_empty());
    }
}
