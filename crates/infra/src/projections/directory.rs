//! Aggregate directory: one entry per aggregate that has ever committed.
//!
//! Kept current by a [`crate::workers::ProjectionWorker`]; serves the
//! current-state snapshot for streaming clients that connect without a
//! resume token, and the per-type statistics endpoint.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use eventide_core::AggregateRef;
use eventide_events::{Event, Projection, ProjectionRunner, SubscriptionPattern, TopicResolver};

use crate::event_store::{EventStore, StoreError};
use crate::stream::{CurrentState, SnapshotSource};
use crate::workers::LiveProjection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub version: u64,
    pub last_event_type: String,
    pub last_global_sequence: u64,
    pub updated_at: DateTime<Utc>,
}

/// Per-type totals derived from the directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub aggregate_count: u64,
    pub event_count: u64,
    pub last_global_sequence: u64,
}

/// The read model itself.
#[derive(Debug, Default)]
pub struct AggregateDirectory {
    entries: BTreeMap<AggregateRef, DirectoryEntry>,
}

impl AggregateDirectory {
    pub fn get(&self, aggregate_ref: &AggregateRef) -> Option<&DirectoryEntry> {
        self.entries.get(aggregate_ref)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AggregateRef, &DirectoryEntry)> {
        self.entries.iter()
    }

    pub fn stats_for(&self, aggregate_type: &str) -> TypeStats {
        self.entries
            .iter()
            .filter(|(aggregate_ref, _)| aggregate_ref.aggregate_type() == aggregate_type)
            .fold(TypeStats::default(), |mut stats, (_, entry)| {
                stats.aggregate_count += 1;
                stats.event_count += entry.version;
                stats.last_global_sequence = stats.last_global_sequence.max(entry.last_global_sequence);
                stats
            })
    }
}

impl Projection for AggregateDirectory {
    fn apply(&mut self, event: &Event) {
        let entry = self
            .entries
            .entry(event.aggregate_ref.clone())
            .or_insert_with(|| DirectoryEntry {
                aggregate_type: event.aggregate_ref.aggregate_type().to_string(),
                aggregate_id: event.aggregate_ref.aggregate_id().to_string(),
                version: 0,
                last_event_type: String::new(),
                last_global_sequence: 0,
                updated_at: event.recorded_at,
            });
        entry.version = entry.version.max(event.local_sequence);
        entry.last_event_type = event.event_type.clone();
        entry.last_global_sequence = event.global_sequence;
        entry.updated_at = event.recorded_at;
    }
}

/// Shared, concurrently readable [`AggregateDirectory`] with its checkpoint.
pub struct DirectoryProjection {
    runner: RwLock<ProjectionRunner<AggregateDirectory>>,
    topics: Arc<dyn TopicResolver>,
}

impl DirectoryProjection {
    pub fn new(topics: Arc<dyn TopicResolver>) -> Self {
        Self {
            runner: RwLock::new(ProjectionRunner::new(AggregateDirectory::default())),
            topics,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ProjectionRunner<AggregateDirectory>> {
        self.runner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProjectionRunner<AggregateDirectory>> {
        self.runner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, aggregate_ref: &AggregateRef) -> Option<DirectoryEntry> {
        self.read().projection().get(aggregate_ref).cloned()
    }

    pub fn entries_matching(&self, pattern: &SubscriptionPattern) -> Vec<DirectoryEntry> {
        self.matching(&self.read(), pattern)
    }

    fn matching(
        &self,
        runner: &ProjectionRunner<AggregateDirectory>,
        pattern: &SubscriptionPattern,
    ) -> Vec<DirectoryEntry> {
        runner
            .projection()
            .iter()
            .filter(|(aggregate_ref, _)| pattern.matches(&self.topics.topic_for(aggregate_ref)))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn stats_for(&self, aggregate_type: &str) -> TypeStats {
        self.read().projection().stats_for(aggregate_type)
    }
}

/// Per-type totals folded straight from the event log.
///
/// Unlike [`DirectoryProjection::stats_for`] this reflects every commit made
/// before the call, at the cost of reading the whole log.
pub async fn type_stats_from_log<S>(
    store: &S,
    aggregate_type: &str,
    batch_size: usize,
) -> Result<TypeStats, StoreError>
where
    S: EventStore + ?Sized,
{
    let batch_size = batch_size.max(1);
    let mut runner = ProjectionRunner::new(AggregateDirectory::default());
    let mut cursor = 0;
    loop {
        let page = store.load_since_batch(cursor, batch_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = last.global_sequence;
        runner.run(
            page.iter()
                .map(Arc::as_ref)
                .filter(|event| event.aggregate_ref.aggregate_type() == aggregate_type),
        );
        if page.len() < batch_size {
            break;
        }
    }
    Ok(runner.projection().stats_for(aggregate_type))
}

impl LiveProjection for DirectoryProjection {
    fn checkpoint(&self) -> u64 {
        self.read().checkpoint()
    }

    fn apply_event(&self, event: &Event) -> bool {
        self.write().apply(event).is_ok()
    }
}

#[async_trait]
impl SnapshotSource for DirectoryProjection {
    async fn current_state(
        &self,
        pattern: &SubscriptionPattern,
    ) -> Result<CurrentState, StoreError> {
        // Entries and checkpoint come from the same lock so they agree.
        let runner = self.read();
        let aggregates = self.matching(&runner, pattern);
        let position = runner.checkpoint();
        drop(runner);

        Ok(CurrentState {
            position,
            body: serde_json::json!({
                "position": position,
                "aggregates": aggregates,
            }),
        })
    }
}
