//! The closed set of aggregate types known to the runtime.
//!
//! [`DomainAggregate`] is a tagged variant over every typed aggregate and is
//! the single [`AggregateEngine`] the infrastructure works with. Adding an
//! aggregate type means adding a variant here; the compiler then points at
//! every match that needs a new arm.

use serde::{Deserialize, Serialize};

use eventide_core::{Aggregate, AggregateRef, DomainError, DomainEvent};
use eventide_events::{AggregateEngine, EngineError, Event, NewEvent, Topic, TopicResolver};

use crate::{Account, AccountCommand, Counter, CounterCommand, Task, TaskCommand};

/// Discriminant of [`DomainAggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Counter,
    Account,
    Task,
}

impl AggregateKind {
    pub const ALL: [AggregateKind; 3] = [Self::Counter, Self::Account, Self::Task];

    pub fn aggregate_type(self) -> &'static str {
        match self {
            Self::Counter => Counter::AGGREGATE_TYPE,
            Self::Account => Account::AGGREGATE_TYPE,
            Self::Task => Task::AGGREGATE_TYPE,
        }
    }

    pub fn domain(self) -> &'static str {
        match self {
            Self::Counter => Counter::DOMAIN,
            Self::Account => Account::DOMAIN,
            Self::Task => Task::DOMAIN,
        }
    }

    pub fn from_type(aggregate_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.aggregate_type() == aggregate_type)
    }

    pub fn of(aggregate_ref: &AggregateRef) -> Result<Self, DomainError> {
        Self::from_type(aggregate_ref.aggregate_type())
            .ok_or_else(|| DomainError::unknown_aggregate_type(aggregate_ref.aggregate_type()))
    }
}

/// Aggregate state for any known aggregate type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum DomainAggregate {
    Counter(Counter),
    Account(Account),
    Task(Task),
}

/// Command for any known aggregate type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainCommand {
    Counter(CounterCommand),
    Account(AccountCommand),
    Task(TaskCommand),
}

impl DomainCommand {
    /// Parse a JSON command body for the given aggregate type.
    pub fn from_json(kind: AggregateKind, body: serde_json::Value) -> Result<Self, DomainError> {
        let invalid = |e: serde_json::Error| {
            DomainError::validation(format!("invalid {} command: {e}", kind.aggregate_type()))
        };
        Ok(match kind {
            AggregateKind::Counter => Self::Counter(serde_json::from_value(body).map_err(invalid)?),
            AggregateKind::Account => Self::Account(serde_json::from_value(body).map_err(invalid)?),
            AggregateKind::Task => Self::Task(serde_json::from_value(body).map_err(invalid)?),
        })
    }

    pub fn kind(&self) -> AggregateKind {
        match self {
            Self::Counter(_) => AggregateKind::Counter,
            Self::Account(_) => AggregateKind::Account,
            Self::Task(_) => AggregateKind::Task,
        }
    }
}

impl From<CounterCommand> for DomainCommand {
    fn from(value: CounterCommand) -> Self {
        Self::Counter(value)
    }
}

impl From<AccountCommand> for DomainCommand {
    fn from(value: AccountCommand) -> Self {
        Self::Account(value)
    }
}

impl From<TaskCommand> for DomainCommand {
    fn from(value: TaskCommand) -> Self {
        Self::Task(value)
    }
}

impl DomainAggregate {
    pub fn kind(&self) -> AggregateKind {
        match self {
            Self::Counter(_) => AggregateKind::Counter,
            Self::Account(_) => AggregateKind::Account,
            Self::Task(_) => AggregateKind::Task,
        }
    }
}

fn apply_typed<A: Aggregate>(state: &mut A, event: &Event) -> Result<(), EngineError> {
    let decoded: A::Event = serde_json::from_slice(&event.payload).map_err(|e| decode_error(event, e))?;
    if decoded.event_type() != event.event_type {
        return Err(decode_error(
            event,
            format!("payload is a {}", decoded.event_type()),
        ));
    }
    state.apply(&decoded);
    Ok(())
}

fn decode_error(event: &Event, reason: impl ToString) -> EngineError {
    EngineError::Decode {
        aggregate_ref: event.aggregate_ref.clone(),
        event_type: event.event_type.clone(),
        global_sequence: event.global_sequence,
        reason: reason.to_string(),
    }
}

fn decide_typed<A: Aggregate>(state: &A, command: &A::Command) -> Result<Vec<NewEvent>, EngineError> {
    state
        .decide(command)?
        .iter()
        .map(|event| {
            let payload = serde_json::to_vec(event).map_err(|e| EngineError::Encode {
                what: event.event_type().to_string(),
                reason: e.to_string(),
            })?;
            Ok(NewEvent::new(event.event_type(), payload))
        })
        .collect()
}

fn mismatch(state: AggregateKind, command: AggregateKind) -> EngineError {
    EngineError::Domain(DomainError::validation(format!(
        "{} command sent to a {} aggregate",
        command.aggregate_type(),
        state.aggregate_type()
    )))
}

impl AggregateEngine for DomainAggregate {
    type Command = DomainCommand;

    fn initial(aggregate_ref: &AggregateRef) -> Result<Self, DomainError> {
        Ok(match AggregateKind::of(aggregate_ref)? {
            AggregateKind::Counter => Self::Counter(Counter::default()),
            AggregateKind::Account => Self::Account(Account::default()),
            AggregateKind::Task => Self::Task(Task::default()),
        })
    }

    fn apply(&mut self, event: &Event) -> Result<(), EngineError> {
        match self {
            Self::Counter(state) => apply_typed(state, event),
            Self::Account(state) => apply_typed(state, event),
            Self::Task(state) => apply_typed(state, event),
        }
    }

    fn decide(&self, command: &DomainCommand) -> Result<Vec<NewEvent>, EngineError> {
        match (self, command) {
            (Self::Counter(state), DomainCommand::Counter(cmd)) => decide_typed(state, cmd),
            (Self::Account(state), DomainCommand::Account(cmd)) => decide_typed(state, cmd),
            (Self::Task(state), DomainCommand::Task(cmd)) => decide_typed(state, cmd),
            (state, cmd) => Err(mismatch(state.kind(), cmd.kind())),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self).map_err(|e| EngineError::Encode {
            what: format!("{:?} snapshot", self.kind()),
            reason: e.to_string(),
        })
    }

    fn restore(aggregate_ref: &AggregateRef, blob: &[u8]) -> Result<Self, EngineError> {
        let restored: Self = serde_json::from_slice(blob).map_err(|e| EngineError::Snapshot {
            aggregate_ref: aggregate_ref.clone(),
            reason: e.to_string(),
        })?;
        let expected = AggregateKind::of(aggregate_ref)?;
        if restored.kind() != expected {
            return Err(EngineError::Snapshot {
                aggregate_ref: aggregate_ref.clone(),
                reason: format!("snapshot holds a {:?}", restored.kind()),
            });
        }
        Ok(restored)
    }

    fn view(&self) -> serde_json::Value {
        let state = match self {
            Self::Counter(state) => serde_json::to_value(state),
            Self::Account(state) => serde_json::to_value(state),
            Self::Task(state) => serde_json::to_value(state),
        };
        state.unwrap_or(serde_json::Value::Null)
    }
}

/// Topic mapping for the closed aggregate set:
/// `{domain}/{aggregate_type}/{aggregate_id}`.
///
/// Aggregate types outside the set (only reachable through foreign writers of a
/// shared store) are published under `unknown/`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainTopics;

impl TopicResolver for DomainTopics {
    fn topic_for(&self, aggregate_ref: &AggregateRef) -> Topic {
        let domain = AggregateKind::from_type(aggregate_ref.aggregate_type())
            .map(AggregateKind::domain)
            .unwrap_or("unknown");
        Topic::new(domain, aggregate_ref)
    }
}
