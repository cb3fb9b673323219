//! `eventide-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! aggregate identity, the domain error model, and the typed aggregate
//! contract that every event-sourced state machine implements.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, DomainEvent};
pub use error::{DomainError, DomainResult};
pub use id::AggregateRef;
