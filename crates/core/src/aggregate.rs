//! Typed aggregate contract for event-sourced domain models.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DomainResult;

/// A domain event emitted by an aggregate.
///
/// Events are serialized as JSON payloads by the runtime; `event_type` is the
/// stable, dotted name stored alongside the payload (e.g. `counter.incremented`).
pub trait DomainEvent:
    Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn event_type(&self) -> &'static str;
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `decide(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO or side effects. `apply` is total: every
/// event the aggregate ever emitted must be applicable to the state it was
/// decided against, otherwise replay would diverge from the original run.
pub trait Aggregate:
    Default + Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Name used in `AggregateRef::aggregate_type` and in topics.
    const AGGREGATE_TYPE: &'static str;

    /// Top-level topic segment grouping related aggregate types.
    const DOMAIN: &'static str;

    type Command: Clone + core::fmt::Debug + Send + Sync + 'static;
    type Event: DomainEvent;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    ///
    /// This must not mutate state. State evolution is done through `apply`.
    fn decide(&self, command: &Self::Command) -> DomainResult<Vec<Self::Event>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct Tally {
        total: u32,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Added(u32);

    impl DomainEvent for Added {
        fn event_type(&self) -> &'static str {
            "tally.added"
        }
    }

    impl Aggregate for Tally {
        const AGGREGATE_TYPE: &'static str = "tally";
        const DOMAIN: &'static str = "test";
        type Command = u32;
        type Event = Added;

        fn apply(&mut self, event: &Added) {
            self.total += event.0;
        }

        fn decide(&self, command: &u32) -> DomainResult<Vec<Added>> {
            if *command == 0 {
                return Err(DomainError::validation("zero"));
            }
            Ok(vec![Added(*command)])
        }
    }

    #[test]
    fn decide_is_pure_and_apply_folds() {
        let mut tally = Tally::default();
        let events = tally.decide(&2).unwrap();
        assert_eq!(tally, Tally::default());

        for event in events.iter().chain(&[Added(7)]) {
            tally.apply(event);
        }
        assert_eq!(tally.total, 9);
    }

    #[test]
    fn rejected_command_emits_nothing() {
        assert_eq!(Tally::default().decide(&0), Err(DomainError::validation("zero")));
    }
}
