//! Projection implementations (read model builders).
//!
//! Projections consume committed events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: can be reconstructed from the event log
//! - **Idempotent**: safe for at-least-once delivery (checkpointed by global sequence)

pub mod directory;

pub use directory::{
    type_stats_from_log, AggregateDirectory, DirectoryEntry, DirectoryProjection, TypeStats,
};
