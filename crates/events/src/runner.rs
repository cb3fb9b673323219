//! Projection runner utilities (read model builders).
//!
//! Read models are **disposable**; events are the source of truth.
//! This module provides deterministic replay and checkpoint tracking keyed on
//! the store-wide global sequence, without making storage assumptions.

use thiserror::Error;

use crate::{Event, Projection};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// The event is at or below the checkpoint (already applied).
    #[error("non-monotonic global sequence: last applied {last}, found {found}")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Runs events through a projection and tracks the checkpoint.
#[derive(Debug)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    checkpoint: u64,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            checkpoint: 0,
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// Global sequence of the last applied event (0 before any).
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    /// Apply a single event, enforcing strictly increasing global sequences.
    ///
    /// Redelivered events are rejected without touching the projection, which
    /// makes any projection idempotent under at-least-once delivery.
    pub fn apply(&mut self, event: &Event) -> Result<(), ProjectionError> {
        if event.global_sequence <= self.checkpoint {
            return Err(ProjectionError::NonMonotonicSequence {
                last: self.checkpoint,
                found: event.global_sequence,
            });
        }
        self.projection.apply(event);
        self.checkpoint = event.global_sequence;
        Ok(())
    }

    /// Apply many events in order, skipping ones already applied.
    ///
    /// Returns how many events were applied.
    pub fn run<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> usize {
        events
            .into_iter()
            .filter(|event| self.apply(event).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewEvent;
    use chrono::Utc;
    use eventide_core::AggregateRef;

    #[derive(Debug, Default)]
    struct Count(Vec<u64>);

    impl Projection for Count {
        fn apply(&mut self, event: &Event) {
            self.0.push(event.global_sequence);
        }
    }

    fn ev(global_sequence: u64) -> Event {
        Event::commit(
            AggregateRef::new("counter", "c").unwrap(),
            global_sequence,
            global_sequence,
            NewEvent::new("counter.incremented", b"{}".to_vec()),
            Utc::now(),
        )
    }

    #[test]
    fn duplicates_are_skipped_and_reported() {
        let mut runner = ProjectionRunner::new(Count::default());
        runner.apply(&ev(1)).unwrap();
        runner.apply(&ev(3)).unwrap();
        assert_eq!(
            runner.apply(&ev(3)),
            Err(ProjectionError::NonMonotonicSequence { last: 3, found: 3 })
        );
        assert_eq!(runner.checkpoint(), 3);
        assert_eq!(runner.projection().0, vec![1, 3]);
    }

    #[test]
    fn rebuild_equals_incremental_with_overlap() {
        let history: Vec<Event> = (1..=5).map(ev).collect();
        let mut rebuilt = ProjectionRunner::new(Count::default());
        assert_eq!(rebuilt.run(&history), 5);

        let mut incremental = ProjectionRunner::new(Count::default());
        assert_eq!(incremental.run(&history[..3]), 3);
        // Replay/live overlap: 2 and 3 arrive again.
        assert_eq!(incremental.run(&history[1..]), 2);

        assert_eq!(rebuilt.projection().0, incremental.projection().0);
        assert_eq!(rebuilt.checkpoint(), 5);
    }
}
