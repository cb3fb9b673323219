use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use eventide_core::AggregateRef;
use eventide_events::{Event, NewEvent};

use super::r#trait::{EventStore, Snapshot, StoreError, validate_stream};
use super::sequence::SequenceAllocator;

type Stream = Arc<Mutex<Vec<Arc<Event>>>>;

/// In-memory append-only event store.
///
/// Intended for tests, dev and single-process deployments.
///
/// - Writes to one aggregate are serialized by that aggregate's async mutex;
///   writes to different aggregates proceed concurrently.
/// - Global sequences are allocated and pushed onto the global log under one
///   short write lock, so the global log is always gap-free and in order.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateRef, Stream>>,
    log: RwLock<Vec<Arc<Event>>>,
    sequence: SequenceAllocator,
    snapshots: RwLock<HashMap<AggregateRef, Snapshot>>,
}

fn poisoned(what: &str) -> StoreError {
    StoreError::Backend(format!("{what} lock poisoned"))
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, aggregate_ref: &AggregateRef) -> Result<Option<Stream>, StoreError> {
        let streams = self.streams.read().map_err(|_| poisoned("streams"))?;
        Ok(streams.get(aggregate_ref).cloned())
    }

    fn stream_or_create(&self, aggregate_ref: &AggregateRef) -> Result<Stream, StoreError> {
        if let Some(stream) = self.stream(aggregate_ref)? {
            return Ok(stream);
        }
        let mut streams = self.streams.write().map_err(|_| poisoned("streams"))?;
        Ok(Arc::clone(streams.entry(aggregate_ref.clone()).or_default()))
    }

    /// Number of committed events across all aggregates.
    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn version_of(stream: &[Arc<Event>]) -> u64 {
    stream.last().map(|e| e.local_sequence).unwrap_or(0)
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_ref: &AggregateRef,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Arc<Event>>, StoreError> {
        let stream = self.stream_or_create(aggregate_ref)?;
        let mut stream = stream.lock().await;

        let actual = version_of(&stream);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                aggregate_ref: aggregate_ref.clone(),
                expected: expected_version,
                actual,
            });
        }
        if events.is_empty() {
            return Ok(vec![]);
        }

        let recorded_at = Utc::now();
        let committed: Vec<Arc<Event>> = {
            let mut log = self.log.write().map_err(|_| poisoned("log"))?;
            let globals = self.sequence.allocate(events.len() as u64);
            let committed: Vec<Arc<Event>> = events
                .into_iter()
                .zip(globals)
                .enumerate()
                .map(|(offset, (new_event, global_sequence))| {
                    Arc::new(Event::commit(
                        aggregate_ref.clone(),
                        expected_version + offset as u64 + 1,
                        global_sequence,
                        new_event,
                        recorded_at,
                    ))
                })
                .collect();
            log.extend(committed.iter().cloned());
            committed
        };

        stream.extend(committed.iter().cloned());
        Ok(committed)
    }

    async fn load(
        &self,
        aggregate_ref: &AggregateRef,
        from_version: u64,
    ) -> Result<Vec<Arc<Event>>, StoreError> {
        let Some(stream) = self.stream(aggregate_ref)? else {
            return Ok(vec![]);
        };
        let stream = stream.lock().await;
        let start = (from_version as usize).min(stream.len());
        let events = stream[start..].to_vec();
        validate_stream(aggregate_ref, from_version, &events)?;
        Ok(events)
    }

    async fn load_since_batch(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Arc<Event>>, StoreError> {
        let log = self.log.read().map_err(|_| poisoned("log"))?;
        let start = log.partition_point(|e| e.global_sequence <= after);
        Ok(log[start..].iter().take(limit).cloned().collect())
    }

    async fn current_version(&self, aggregate_ref: &AggregateRef) -> Result<u64, StoreError> {
        match self.stream(aggregate_ref)? {
            Some(stream) => Ok(version_of(&stream.lock().await)),
            None => Ok(0),
        }
    }

    async fn last_global_sequence(&self) -> Result<u64, StoreError> {
        let log = self.log.read().map_err(|_| poisoned("log"))?;
        Ok(log.last().map(|e| e.global_sequence).unwrap_or(0))
    }

    async fn get_snapshot(
        &self,
        aggregate_ref: &AggregateRef,
    ) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| poisoned("snapshots"))?;
        Ok(snapshots.get(aggregate_ref).cloned())
    }

    async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().map_err(|_| poisoned("snapshots"))?;
        snapshots.insert(snapshot.aggregate_ref.clone(), snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(id: &str) -> AggregateRef {
        AggregateRef::new("counter", id).unwrap()
    }

    fn new_events(n: usize) -> Vec<NewEvent> {
        (0..n)
            .map(|i| NewEvent::new("counter.incremented", format!("{{\"n\":{i}}}").into_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn append_assigns_local_and_global_sequences() {
        let store = InMemoryEventStore::new();
        let a = counter("a");
        let b = counter("b");

        let first = store.append(&a, 0, new_events(2)).await.unwrap();
        let second = store.append(&b, 0, new_events(1)).await.unwrap();
        let third = store.append(&a, 2, new_events(1)).await.unwrap();

        let locals: Vec<u64> = first.iter().chain(&third).map(|e| e.local_sequence).collect();
        assert_eq!(locals, vec![1, 2, 3]);
        assert_eq!(second[0].local_sequence, 1);

        let globals: Vec<u64> = store
            .load_since(0)
            .await
            .unwrap()
            .iter()
            .map(|e| e.global_sequence)
            .collect();
        assert_eq!(globals, vec![1, 2, 3, 4]);
        assert_eq!(store.last_global_sequence().await.unwrap(), 4);
        assert_eq!(store.current_version(&a).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts_and_appends_nothing() {
        let store = InMemoryEventStore::new();
        let c = counter("c1");
        store.append(&c, 0, new_events(5)).await.unwrap();

        let err = store.append(&c, 4, new_events(1)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                aggregate_ref: c.clone(),
                expected: 4,
                actual: 5
            }
        );
        assert_eq!(store.load(&c, 0).await.unwrap().len(), 5);
        assert_eq!(store.last_global_sequence().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let store = InMemoryEventStore::new();
        let c = counter("c");
        assert!(store.append(&c, 0, vec![]).await.unwrap().is_empty());
        assert_eq!(store.last_global_sequence().await.unwrap(), 0);

        store.append(&c, 0, new_events(1)).await.unwrap();
        assert!(store.append(&c, 1, vec![]).await.unwrap().is_empty());
        assert_eq!(store.last_global_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn load_respects_from_version() {
        let store = InMemoryEventStore::new();
        let c = counter("c");
        store.append(&c, 0, new_events(4)).await.unwrap();

        let tail = store.load(&c, 2).await.unwrap();
        assert_eq!(
            tail.iter().map(|e| e.local_sequence).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(store.load(&c, 4).await.unwrap().is_empty());
        assert!(store.load(&c, 10).await.unwrap().is_empty());
        assert!(store.load(&counter("missing"), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_since_batch_pages_in_global_order() {
        let store = InMemoryEventStore::new();
        for id in ["a", "b", "c"] {
            store.append(&counter(id), 0, new_events(3)).await.unwrap();
        }

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let page = store.load_since_batch(cursor, 4).await.unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().unwrap().global_sequence;
            seen.extend(page.iter().map(|e| e.global_sequence));
        }
        assert_eq!(seen, (1..=9).collect::<Vec<_>>());
        assert!(store.load_since(9).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_at_same_version_admit_exactly_one() {
        let store = Arc::new(InMemoryEventStore::new());
        let c = counter("contended");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let c = c.clone();
                tokio::spawn(async move { store.append(&c, 0, new_events(1)).await })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::VersionConflict { actual: 1, .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((ok, conflicts), (1, 15));
        assert_eq!(store.load(&c, 0).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_keep_both_orders_gap_free() {
        let store = Arc::new(InMemoryEventStore::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let r = counter(&format!("w{i}"));
                    for version in 0..25u64 {
                        store.append(&r, version * 2, new_events(2)).await.unwrap();
                        store.append(&r, version * 2 + 2, vec![]).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let all = store.load_since(0).await.unwrap();
        let globals: Vec<u64> = all.iter().map(|e| e.global_sequence).collect();
        assert_eq!(globals, (1..=400).collect::<Vec<_>>());
        for i in 0..8 {
            let stream = store.load(&counter(&format!("w{i}")), 0).await.unwrap();
            assert_eq!(stream.len(), 50);
            assert!(stream.windows(2).all(|w| w[0].global_sequence < w[1].global_sequence));
        }
    }

    #[tokio::test]
    async fn snapshots_are_overwritten() {
        let store = InMemoryEventStore::new();
        let c = counter("c");
        assert!(store.get_snapshot(&c).await.unwrap().is_none());

        for version in [3, 6] {
            store
                .put_snapshot(Snapshot {
                    aggregate_ref: c.clone(),
                    version,
                    state_blob: vec![version as u8],
                })
                .await
                .unwrap();
        }
        let snapshot = store.get_snapshot(&c).await.unwrap().unwrap();
        assert_eq!((snapshot.version, snapshot.state_blob), (6, vec![6]));
    }

    #[tokio::test]
    async fn cursors_past_the_head_return_nothing() {
        let store = InMemoryEventStore::new();
        let a = counter("a");
        store.append(&a, 0, new_events(3)).await.unwrap();

        assert!(store.load(&a, u64::MAX).await.unwrap().is_empty());
        assert!(store.load_since_batch(u64::MAX, 10).await.unwrap().is_empty());
        assert!(store.load_since(i64::MAX as u64 + 1).await.unwrap().is_empty());
    }
}
