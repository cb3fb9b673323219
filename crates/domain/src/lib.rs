//! Domain modules (event-sourced).
//!
//! Business rules for every aggregate type, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage), plus the
//! [`DomainAggregate`] engine that exposes them to the runtime.

pub mod account;
pub mod counter;
pub mod engine;
pub mod task;

pub use account::{Account, AccountCommand, AccountEvent, AccountStatus};
pub use counter::{Counter, CounterCommand, CounterEvent};
pub use engine::{AggregateKind, DomainAggregate, DomainCommand, DomainTopics};
pub use task::{Task, TaskCommand, TaskEvent, TaskStatus};
