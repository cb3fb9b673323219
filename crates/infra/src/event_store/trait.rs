use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use eventide_core::AggregateRef;
use eventide_events::{Event, NewEvent};

/// Aggregate snapshot for fast rehydration.
///
/// A snapshot is a **cache** of a fold result at `version`. It can be deleted,
/// overwritten or ignored at any time; when it disagrees with the event stream,
/// the events win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub aggregate_ref: AggregateRef,
    pub version: u64,
    pub state_blob: Vec<u8>,
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, corruption) as
/// opposed to domain errors (validation, invariants).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency check failed; nothing was appended.
    #[error("version conflict on {aggregate_ref}: expected {expected}, actual {actual}")]
    VersionConflict {
        aggregate_ref: AggregateRef,
        expected: u64,
        actual: u64,
    },

    /// The backend failed (connection, query, serialization).
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The backend did not answer within the configured deadline.
    #[error("storage operation {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A loaded stream violates the local-sequence invariant.
    #[error("event stream corrupted for {aggregate_ref}: {detail}")]
    Corrupted {
        aggregate_ref: AggregateRef,
        detail: String,
    },
}

impl StoreError {
    /// Whether re-running the whole command (reload, decide, append) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Timeout { .. })
    }
}

/// Append-only event store.
///
/// Events are organized into **streams**, one per aggregate instance, keyed by
/// [`AggregateRef`]. Within a stream, events carry `local_sequence` 1, 2, 3, ...
/// Across the whole store every event also carries a `global_sequence` that is
/// strictly increasing in commit order; it is the resume token for streaming
/// consumers.
///
/// ## Append Semantics
///
/// `append()`:
/// - checks optimistic concurrency (current version must equal `expected_version`)
/// - assigns local sequences starting at `expected_version + 1`
/// - allocates one global sequence per event inside the same commit
/// - persists the batch atomically (all or nothing)
/// - treats an empty batch as a no-op (no sequence is consumed)
///
/// ## Load Semantics
///
/// - `load()` returns one stream in local order, validated for gaps
/// - `load_since()` / `load_since_batch()` return the global log in global order
///
/// ## Implementation Requirements
///
/// A reader that observes global sequence `n` must also be able to observe
/// every committed event below `n`. Relays and stream sessions page through
/// the log by "after X" cursors and would otherwise skip events for good.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        aggregate_ref: &AggregateRef,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Arc<Event>>, StoreError>;

    /// Events of one aggregate with `local_sequence > from_version`.
    async fn load(
        &self,
        aggregate_ref: &AggregateRef,
        from_version: u64,
    ) -> Result<Vec<Arc<Event>>, StoreError>;

    /// All events with `global_sequence > after`, in global order.
    async fn load_since(&self, after: u64) -> Result<Vec<Arc<Event>>, StoreError> {
        self.load_since_batch(after, usize::MAX).await
    }

    /// At most `limit` events with `global_sequence > after`, in global order.
    async fn load_since_batch(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Arc<Event>>, StoreError>;

    /// Highest local sequence of the aggregate (0 if it has no events).
    async fn current_version(&self, aggregate_ref: &AggregateRef) -> Result<u64, StoreError>;

    /// Highest committed global sequence (0 if the store is empty).
    async fn last_global_sequence(&self) -> Result<u64, StoreError>;

    async fn get_snapshot(
        &self,
        aggregate_ref: &AggregateRef,
    ) -> Result<Option<Snapshot>, StoreError>;

    async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        aggregate_ref: &AggregateRef,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Arc<Event>>, StoreError> {
        (**self).append(aggregate_ref, expected_version, events).await
    }

    async fn load(
        &self,
        aggregate_ref: &AggregateRef,
        from_version: u64,
    ) -> Result<Vec<Arc<Event>>, StoreError> {
        (**self).load(aggregate_ref, from_version).await
    }

    async fn load_since(&self, after: u64) -> Result<Vec<Arc<Event>>, StoreError> {
        (**self).load_since(after).await
    }

    async fn load_since_batch(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Arc<Event>>, StoreError> {
        (**self).load_since_batch(after, limit).await
    }

    async fn current_version(&self, aggregate_ref: &AggregateRef) -> Result<u64, StoreError> {
        (**self).current_version(aggregate_ref).await
    }

    async fn last_global_sequence(&self) -> Result<u64, StoreError> {
        (**self).last_global_sequence().await
    }

    async fn get_snapshot(
        &self,
        aggregate_ref: &AggregateRef,
    ) -> Result<Option<Snapshot>, StoreError> {
        (**self).get_snapshot(aggregate_ref).await
    }

    async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        (**self).put_snapshot(snapshot).await
    }
}

/// Validate that `events` continue `aggregate_ref`'s stream at `from_version + 1`
/// without gaps or repeats.
pub fn validate_stream(
    aggregate_ref: &AggregateRef,
    from_version: u64,
    events: &[Arc<Event>],
) -> Result<(), StoreError> {
    // `None` once the expected sequence would pass `u64::MAX`.
    let mut expected = from_version.checked_add(1);
    for event in events {
        if event.aggregate_ref != *aggregate_ref {
            return Err(StoreError::Corrupted {
                aggregate_ref: aggregate_ref.clone(),
                detail: format!(
                    "event #{} belongs to {}",
                    event.global_sequence, event.aggregate_ref
                ),
            });
        }
        if Some(event.local_sequence) != expected {
            let detail = match expected {
                Some(next) if event.local_sequence > next => format!(
                    "gap: expected local sequence {next}, found {}",
                    event.local_sequence
                ),
                _ => format!("local sequence {} repeated", event.local_sequence),
            };
            return Err(StoreError::Corrupted {
                aggregate_ref: aggregate_ref.clone(),
                detail,
            });
        }
        expected = expected.and_then(|next| next.checked_add(1));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ev(r: &AggregateRef, local: u64) -> Arc<Event> {
        Arc::new(Event::commit(
            r.clone(),
            local,
            local.wrapping_mul(10),
            NewEvent::new("x", Vec::new()),
            Utc::now(),
        ))
    }

    #[test]
    fn validate_stream_detects_gaps_and_repeats() {
        let r = AggregateRef::new("counter", "c").unwrap();
        assert!(validate_stream(&r, 0, &[ev(&r, 1), ev(&r, 2)]).is_ok());
        assert!(validate_stream(&r, 2, &[ev(&r, 3)]).is_ok());

        let gap = validate_stream(&r, 0, &[ev(&r, 1), ev(&r, 3)]).unwrap_err();
        assert!(matches!(gap, StoreError::Corrupted { ref detail, .. } if detail.contains("gap")));

        let repeat = validate_stream(&r, 0, &[ev(&r, 1), ev(&r, 1)]).unwrap_err();
        assert!(matches!(repeat, StoreError::Corrupted { ref detail, .. } if detail.contains("repeated")));

        let other = AggregateRef::new("counter", "d").unwrap();
        assert!(validate_stream(&r, 0, &[ev(&other, 1)]).is_err());
    }

    #[test]
    fn validate_stream_accepts_the_largest_version() {
        let r = AggregateRef::new("counter", "c").unwrap();
        assert!(validate_stream(&r, u64::MAX, &[]).is_ok());
        assert!(validate_stream(&r, u64::MAX - 1, &[ev(&r, u64::MAX)]).is_ok());

        let past_max = validate_stream(&r, u64::MAX, &[ev(&r, u64::MAX)]).unwrap_err();
        assert!(matches!(past_max, StoreError::Corrupted { ref detail, .. } if detail.contains("repeated")));
    }

    #[test]
    fn only_conflicts_and_timeouts_are_retryable() {
        let r = AggregateRef::new("counter", "c").unwrap();
        assert!(StoreError::VersionConflict { aggregate_ref: r.clone(), expected: 1, actual: 2 }.is_retryable());
        assert!(StoreError::Timeout { operation: "load", after: Duration::from_millis(5) }.is_retryable());
        assert!(!StoreError::Backend("down".into()).is_retryable());
        assert!(!StoreError::Corrupted { aggregate_ref: r, detail: "gap".into() }.is_retryable());
    }
}
