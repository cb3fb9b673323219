//! Append-only event store boundary.
//!
//! This module defines the storage abstraction for per-aggregate event streams
//! plus the store-wide global log, and its in-memory and Postgres backends.

pub mod in_memory;
pub mod postgres;
pub mod sequence;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, Snapshot, StoreError, validate_stream};
pub use sequence::SequenceAllocator;
