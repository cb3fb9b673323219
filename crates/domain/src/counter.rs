use serde::{Deserialize, Serialize};

use eventide_core::{Aggregate, DomainError, DomainEvent, DomainResult};

/// Aggregate root: Counter (domain `metrics`).
///
/// A non-negative tally that can be moved up and down and reset to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    value: u64,
    resets: u64,
}

impl Counter {
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CounterCommand {
    Increment { by: u64 },
    Decrement { by: u64 },
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterEvent {
    Incremented { by: u64 },
    Decremented { by: u64 },
    Reset { previous: u64 },
}

impl DomainEvent for CounterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CounterEvent::Incremented { .. } => "counter.incremented",
            CounterEvent::Decremented { .. } => "counter.decremented",
            CounterEvent::Reset { .. } => "counter.reset",
        }
    }
}

impl Aggregate for Counter {
    const AGGREGATE_TYPE: &'static str = "counter";
    const DOMAIN: &'static str = "metrics";

    type Command = CounterCommand;
    type Event = CounterEvent;

    fn apply(&mut self, event: &CounterEvent) {
        match event {
            CounterEvent::Incremented { by } => self.value = self.value.saturating_add(*by),
            CounterEvent::Decremented { by } => self.value = self.value.saturating_sub(*by),
            CounterEvent::Reset { .. } => {
                self.value = 0;
                self.resets += 1;
            }
        }
    }

    fn decide(&self, command: &CounterCommand) -> DomainResult<Vec<CounterEvent>> {
        match command {
            CounterCommand::Increment { by } => {
                ensure_positive(*by)?;
                if self.value.checked_add(*by).is_none() {
                    return Err(DomainError::invariant("counter would overflow"));
                }
                Ok(vec![CounterEvent::Incremented { by: *by }])
            }
            CounterCommand::Decrement { by } => {
                ensure_positive(*by)?;
                if *by > self.value {
                    return Err(DomainError::invariant(format!(
                        "counter cannot go negative (value {}, decrement {by})",
                        self.value
                    )));
                }
                Ok(vec![CounterEvent::Decremented { by: *by }])
            }
            CounterCommand::Reset => {
                if self.value == 0 {
                    return Err(DomainError::invariant("counter is already zero"));
                }
                Ok(vec![CounterEvent::Reset {
                    previous: self.value,
                }])
            }
        }
    }
}

fn ensure_positive(by: u64) -> DomainResult<()> {
    if by == 0 {
        return Err(DomainError::validation("`by` must be greater than zero"));
    }
    Ok(())
}
