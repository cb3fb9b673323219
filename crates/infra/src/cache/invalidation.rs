use std::sync::Arc;

use tracing::{debug, info, warn};

use eventide_events::{EventBus, RecvError, SubscriptionPattern};

use super::InvalidatingCache;
use crate::workers::WorkerHandle;

/// Invalidate `cache` from every published event and sweep expired entries.
///
/// The subscription is created before this returns, so events published
/// afterwards are never missed. A lagged subscription clears the whole cache.
pub fn spawn_invalidator<V, B>(cache: Arc<InvalidatingCache<V>>, bus: &B) -> WorkerHandle
where
    V: Clone + Send + Sync + 'static,
    B: EventBus + ?Sized,
{
    let mut subscription = bus.subscribe(SubscriptionPattern::all());
    let sweep_interval = cache.config().sweep_interval;

    WorkerHandle::spawn("cache-invalidator", move |mut shutdown| async move {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("cache invalidator starting");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = subscription.recv() => match received {
                    Ok(event) => {
                        let removed = cache.invalidate_aggregate_type(event.aggregate_ref.aggregate_type());
                        if removed > 0 {
                            debug!(
                                aggregate_type = event.aggregate_ref.aggregate_type(),
                                global_sequence = event.global_sequence,
                                removed,
                                "cache entries invalidated"
                            );
                        }
                    }
                    Err(RecvError::Lagged { skipped }) => {
                        let removed = cache.invalidate_all();
                        warn!(skipped, removed, "cache invalidator lagged; cleared cache");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = sweep.tick() => {
                    let evicted = cache.evict_expired();
                    if evicted > 0 {
                        debug!(evicted, "expired cache entries swept");
                    }
                }
            }
        }
        info!("cache invalidator stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use chrono::Utc;
    use eventide_core::AggregateRef;
    use eventide_events::{Event, FixedDomain, InMemoryEventBus, NewEvent, Topic, TopicResolver};

    use super::*;
    use crate::cache::{CacheConfig, CacheKey};

    fn publish(bus: &InMemoryEventBus, aggregate_type: &str, global: u64) {
        let r = AggregateRef::new(aggregate_type, "x").unwrap();
        let event = Event::commit(r, 1, global, NewEvent::new("changed", b"{}".to_vec()), Utc::now());
        let topic: Topic = FixedDomain::new("test").topic_of(&event);
        bus.publish(&topic, Arc::new(event)).unwrap();
    }

    async fn fill(cache: &InvalidatingCache<u64>, key: &CacheKey) {
        cache
            .get_or_compute(key, None, || async { Ok::<_, Infallible>(7) })
            .await
            .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn published_events_invalidate_dependents() {
        let bus = InMemoryEventBus::new();
        let cache = Arc::new(InvalidatingCache::new(CacheConfig::default()));
        let counters = CacheKey::new("stats:counter").depends_on("counter");
        let tasks = CacheKey::new("stats:task").depends_on("task");
        fill(&cache, &counters).await;
        fill(&cache, &tasks).await;

        let worker = spawn_invalidator(Arc::clone(&cache), &bus);
        publish(&bus, "counter", 1);

        eventually(|| cache.len() == 1).await;
        assert_eq!(cache.stats().invalidations, 1);
        worker.shutdown().await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lag_clears_everything() {
        let bus = InMemoryEventBus::with_capacity(1);
        let cache = Arc::new(InvalidatingCache::new(CacheConfig::default()));
        fill(&cache, &CacheKey::new("stats:task").depends_on("task")).await;
        fill(&cache, &CacheKey::new("unrelated")).await;

        let worker = spawn_invalidator(Arc::clone(&cache), &bus);
        // Nothing depends on "counter", but overflow makes the events unknowable.
        publish(&bus, "counter", 1);
        publish(&bus, "counter", 2);
        publish(&bus, "counter", 3);

        eventually(|| cache.is_empty()).await;
        worker.shutdown().await;
    }
}
